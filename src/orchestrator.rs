//! The six-stage streaming pipeline: §4.7.
//!
//! Grounded on the teacher's `CacheManager::get_or_compute` for the
//! stampede-protected read-through shape of Stage 2, on `ccheney-reflex`'s
//! gateway handler for the overall async/SSE plumbing, and on the teacher's
//! `InvalidationSubscriber` (`tokio::spawn` + a cancellation channel) for the
//! heartbeat task that runs alongside Stage 5.
//!
//! The public surface yields already-wire-formatted SSE text blocks rather
//! than `SSEEvent` values: the queue-failover consumer (§4.8) publishes
//! pre-rendered wire strings onto the per-request pub/sub channel, and the
//! publisher side only ever relays them verbatim — so making the local path
//! produce the same representation avoids a pointless parse/re-render round
//! trip and gives `http.rs` one representation to write to the response body.

use crate::bus::MessageBus;
use crate::cache::ResponseCache;
use crate::circuit_breaker::DistributedCircuitBreaker;
use crate::error::GatewayError;
use crate::model::{QueuedStreamingRequest, SSEEvent, StreamRequest};
use crate::pool::ConnectionPoolManager;
use crate::providers::ProviderRegistry;
use crate::queue_failover::{BackpressureConfig, QueuePublisher};
use crate::retry::{self, RetryConfig};
use crate::tracker::ExecutionTracker;
use dashmap::DashMap;
use futures_util::stream::{unfold, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, warn};

/// Feature flags toggleable at runtime through `/admin/config`, shared
/// between the HTTP admin surface and the orchestrator that consults them —
/// a write through one is visible to the other immediately.
pub struct RuntimeFlags {
    pub use_fake_llm: AtomicBool,
    pub enable_caching: AtomicBool,
}

pub struct OrchestratorConfig {
    pub cb_failure_threshold: u32,
    pub cb_recovery_timeout: Duration,
    pub retry: RetryConfig,
    pub l2_default_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub first_chunk_timeout: Duration,
    pub total_request_timeout: Duration,
    pub queue_failover_timeout: Duration,
    pub queue_max_depth: u64,
    pub queue_backpressure_threshold: f64,
    pub queue_backpressure_max_retries: u32,
    pub queue_backpressure_base_delay: Duration,
    pub queue_backpressure_max_delay: Duration,
}

pub struct StreamOrchestrator {
    cache: ResponseCache,
    pool: Arc<ConnectionPoolManager>,
    real_registry: Arc<ProviderRegistry>,
    fake_registry: Arc<ProviderRegistry>,
    tracker: Arc<ExecutionTracker>,
    bus: Arc<dyn MessageBus>,
    kv: crate::kv::KvClient,
    circuits: DashMap<String, Arc<DistributedCircuitBreaker>>,
    flags: Arc<RuntimeFlags>,
    config: OrchestratorConfig,
}

impl StreamOrchestrator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: ResponseCache,
        pool: Arc<ConnectionPoolManager>,
        real_registry: Arc<ProviderRegistry>,
        fake_registry: Arc<ProviderRegistry>,
        tracker: Arc<ExecutionTracker>,
        bus: Arc<dyn MessageBus>,
        kv: crate::kv::KvClient,
        flags: Arc<RuntimeFlags>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            cache,
            pool,
            real_registry,
            fake_registry,
            tracker,
            bus,
            kv,
            circuits: DashMap::new(),
            flags,
            config,
        }
    }

    /// The live provider registry: `use_fake_llm` is toggleable through
    /// `/admin/config` and consulted fresh on every request, mirroring the
    /// original's `register_providers()` re-registration on flag flip.
    fn active_registry(&self) -> &Arc<ProviderRegistry> {
        if self.flags.use_fake_llm.load(Ordering::Relaxed) {
            &self.fake_registry
        } else {
            &self.real_registry
        }
    }

    #[must_use]
    pub fn flags(&self) -> &Arc<RuntimeFlags> {
        &self.flags
    }

    #[must_use]
    pub fn bus_backing_name(&self) -> &'static str {
        self.bus.backing_name()
    }

    /// Snapshot of every circuit this orchestrator has touched so far, for
    /// `/admin/circuit-breakers`. A provider that has never been selected has
    /// no entry yet (equivalent to CLOSED, just not yet observed).
    pub async fn circuit_snapshot(&self) -> Vec<(String, crate::circuit_breaker::CircuitState)> {
        let mut out = Vec::new();
        for entry in &self.circuits {
            out.push((entry.key().clone(), entry.value().state().await));
        }
        out
    }

    fn circuit_for(&self, provider_name: &str) -> Arc<DistributedCircuitBreaker> {
        self.circuits
            .entry(provider_name.to_string())
            .or_insert_with(|| {
                Arc::new(DistributedCircuitBreaker::new(
                    format!("provider:{provider_name}"),
                    self.kv.clone(),
                    self.config.cb_failure_threshold,
                    self.config.cb_recovery_timeout,
                ))
            })
            .clone()
    }

    /// Run the pipeline for one request, returning a lazy stream of
    /// wire-formatted SSE text blocks. The pipeline itself runs on a spawned
    /// task so the caller can drop the returned stream (client disconnect) to
    /// cancel everything downstream.
    pub fn stream(self: Arc<Self>, request: StreamRequest) -> BoxStream<'static, String> {
        let (tx, rx) = mpsc::channel::<String>(32);
        let total_timeout = self.config.total_request_timeout;

        tokio::spawn(async move {
            let thread_id = request.thread_id.clone();
            let body = self.clone().run_pipeline(request, tx.clone());
            if tokio::time::timeout(total_timeout, body).await.is_err() {
                warn!(thread_id, "total request timeout exceeded, aborting pipeline");
                let _ = tx
                    .send(SSEEvent::Error { error: "STREAM_TIMEOUT".into(), message: "total request timeout exceeded".into() }.to_wire())
                    .await;
                self.tracker.clear_thread_data(&thread_id);
            }
        });

        Box::pin(unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }))
    }

    async fn run_pipeline(self: Arc<Self>, request: StreamRequest, tx: mpsc::Sender<String>) {
        let thread_id = request.thread_id.clone();
        let user_id = request.user_id.clone();
        let start = Instant::now();

        // Stage 1 — validate.
        let stage1 = self.tracker.track_stage("1", "validate", &thread_id, false);
        let validation = request.validate();
        drop(stage1);
        if let Err(e) = validation {
            let _ = tx.send(SSEEvent::Error { error: e.code().into(), message: e.to_string() }.to_wire()).await;
            self.tracker.clear_thread_data(&thread_id);
            return;
        }

        // Stage 2 — cache lookup.
        let fingerprint = request.fingerprint();
        if self.flags.enable_caching.load(Ordering::Relaxed) {
            let mut stage2 = self.tracker.track_stage("2", "cache lookup", &thread_id, false);
            if let Some(bytes) = self.cache.get(&fingerprint).await {
                drop(stage2.take());
                let content = String::from_utf8_lossy(&bytes).to_string();
                let _ = tx.send(SSEEvent::Status { data: "cached".into() }.to_wire()).await;
                let _ = tx
                    .send(SSEEvent::Chunk { content: content.clone(), cached: Some(true), index: None }.to_wire())
                    .await;
                let _ = tx
                    .send(
                        SSEEvent::Complete {
                            thread_id: thread_id.clone(),
                            chunk_count: 1,
                            total_length: content.len(),
                            duration_ms: start.elapsed().as_millis() as u64,
                            cached: true,
                        }
                        .to_wire(),
                    )
                    .await;
                self.tracker.clear_thread_data(&thread_id);
                return;
            }
        }

        // Stage 3 — admission.
        let admitted = {
            let _stage3 = self.tracker.track_stage("3", "admission", &thread_id, false);
            self.pool.acquire(&user_id, &thread_id).await
        };

        match admitted {
            Ok(()) => {}
            Err(GatewayError::ConnectionPoolExhausted | GatewayError::UserConnectionLimit) => {
                self.run_queue_failover(request, tx).await;
                self.tracker.clear_thread_data(&thread_id);
                return;
            }
            Err(e) => {
                let _ = tx.send(SSEEvent::Error { error: e.code().into(), message: e.to_string() }.to_wire()).await;
                self.tracker.clear_thread_data(&thread_id);
                return;
            }
        }

        let result = self.run_stages_4_to_6(&request, &tx, start).await;
        self.pool.release(&user_id, &thread_id).await;
        if let Err(e) = result {
            let _ = tx.send(SSEEvent::Error { error: e.code().into(), message: e.to_string() }.to_wire()).await;
        }
        self.tracker.clear_thread_data(&thread_id);
    }

    /// Stages 4-6, shared between the local path and the queue-consumer path.
    /// Returns an error only for conditions the caller must surface as an
    /// `error` SSEEvent; success has already been fully emitted on `tx`.
    async fn run_stages_4_to_6(
        &self,
        request: &StreamRequest,
        tx: &mpsc::Sender<String>,
        start: Instant,
    ) -> Result<(), GatewayError> {
        // Stage 4 — provider selection.
        let provider = {
            let _stage4 = self.tracker.track_stage("4", "provider selection", &request.thread_id, false);

            let registry = self.active_registry();
            let mut chosen = None;
            if let Some(name) = &request.provider {
                if let Some(p) = registry.get(name) {
                    let circuit = self.circuit_for(name);
                    if circuit.should_allow_request().await && p.supports_model(&request.model) {
                        chosen = Some(p);
                    }
                }
            }
            if chosen.is_none() {
                for candidate in registry.candidates(None, &request.model) {
                    let circuit = self.circuit_for(candidate.name());
                    if circuit.should_allow_request().await {
                        chosen = Some(candidate);
                        break;
                    }
                }
            }
            chosen
        };

        let Some(provider) = provider else {
            return Err(GatewayError::AllProvidersDown);
        };

        // Stage 5 — LLM stream, wrapped in the resilience interlock.
        let circuit = self.circuit_for(provider.name());
        let provider_name = provider.name().to_string();
        let query = request.query.clone();
        let model = request.model.clone();

        let establish = {
            let provider = provider.clone();
            move || {
                let provider = provider.clone();
                let query = query.clone();
                let model = model.clone();
                async move { provider.stream(&query, &model).await }
            }
        };

        let mut llm_stream = retry::call_with_retry(circuit.as_ref(), &self.config.retry, &provider_name, establish).await?;

        let (hb_stop_tx, mut hb_stop_rx) = tokio::sync::oneshot::channel::<()>();
        let hb_tx = tx.clone();
        let hb_interval = self.config.heartbeat_interval;
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(hb_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if hb_tx.send(SSEEvent::Heartbeat.to_wire()).await.is_err() {
                            break;
                        }
                    }
                    _ = &mut hb_stop_rx => break,
                }
            }
        });

        let mut buffer = String::new();
        let mut chunk_count = 0usize;
        let _stage5 = self.tracker.track_stage("5", "llm stream", &request.thread_id, false);

        let first = tokio::time::timeout(self.config.first_chunk_timeout, llm_stream.next()).await;
        let mut stream_error = None;
        let mut finished = false;

        match first {
            Ok(Some(Ok(chunk))) => {
                if !chunk.content.is_empty() {
                    buffer.push_str(&chunk.content);
                    chunk_count += 1;
                    let _ = tx
                        .send(SSEEvent::Chunk { content: chunk.content, cached: Some(false), index: Some(chunk_count - 1) }.to_wire())
                        .await;
                }
                finished = chunk.finish_reason.is_some();
            }
            Ok(Some(Err(e))) => stream_error = Some(e),
            Ok(None) => stream_error = Some(GatewayError::Internal("provider stream ended with no chunks".into())),
            Err(_) => stream_error = Some(GatewayError::StreamingTimeout("first chunk timeout".into())),
        }

        if stream_error.is_none() && !finished {
            while let Some(next) = llm_stream.next().await {
                match next {
                    Ok(chunk) => {
                        if !chunk.content.is_empty() {
                            buffer.push_str(&chunk.content);
                            chunk_count += 1;
                            let _ = tx
                                .send(SSEEvent::Chunk { content: chunk.content, cached: Some(false), index: Some(chunk_count - 1) }.to_wire())
                                .await;
                        }
                        if chunk.finish_reason.is_some() {
                            break;
                        }
                    }
                    Err(e) => {
                        stream_error = Some(e);
                        break;
                    }
                }
            }
        }

        let _ = hb_stop_tx.send(());
        let _ = heartbeat.await;

        // Stage 6 — cache store & complete.
        let _stage6 = self.tracker.track_stage("6", "cache store & complete", &request.thread_id, false);

        if let Some(e) = stream_error {
            return Err(e);
        }

        if self.flags.enable_caching.load(Ordering::Relaxed) {
            if let Err(e) = self.cache.set(&request.fingerprint(), buffer.as_bytes(), self.config.l2_default_ttl).await {
                warn!(error = %e, "failed to write response to cache");
            }
        }

        let _ = tx
            .send(
                SSEEvent::Complete {
                    thread_id: request.thread_id.clone(),
                    chunk_count,
                    total_length: buffer.len(),
                    duration_ms: start.elapsed().as_millis() as u64,
                    cached: false,
                }
                .to_wire(),
            )
            .await;

        Ok(())
    }

    /// §4.8 publisher side: subscribe, enqueue, relay until a terminal signal.
    async fn run_queue_failover(&self, request: StreamRequest, tx: mpsc::Sender<String>) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let backpressure = BackpressureConfig {
            max_depth: self.config.queue_max_depth,
            threshold: self.config.queue_backpressure_threshold,
            max_retries: self.config.queue_backpressure_max_retries,
            base_delay: self.config.queue_backpressure_base_delay,
            max_delay: self.config.queue_backpressure_max_delay,
        };
        let publisher = QueuePublisher::new(self.kv.clone(), self.bus.clone(), self.config.queue_failover_timeout, backpressure);

        match publisher.submit(&request_id, request).await {
            Ok(lines) => {
                for line in lines {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                error!(request_id, error = %e, "queue failover did not complete");
                let _ = tx.send(SSEEvent::Error { error: e.code().into(), message: e.to_string() }.to_wire()).await;
            }
        }
    }
}

/// Runs the consumer half of §4.8: pulls queued requests and executes
/// Stages 4-6 on their behalf, publishing results back over the per-request
/// pub/sub channel instead of yielding to a local stream.
pub async fn run_queue_consumer_once(
    orchestrator: &StreamOrchestrator,
    bus: &dyn MessageBus,
    kv: &crate::kv::KvClient,
    pool: &ConnectionPoolManager,
    consumer_name: &str,
    batch_size: usize,
    block_ms: u64,
    max_retries: u32,
    timeout_secs: f64,
    base_delay_ms: u64,
) -> anyhow::Result<usize> {
    let messages = bus.consume(consumer_name, batch_size, block_ms).await?;
    let count = messages.len();

    for message in messages {
        let request: QueuedStreamingRequest = message.payload;
        let channel = format!("queue:results:{}", request.request_id);

        if request.age_secs() > timeout_secs {
            bus.acknowledge(&message.id).await?;
            continue;
        }

        match pool.acquire(&request.payload.user_id, &request.payload.thread_id).await {
            Ok(()) => {
                let (tx, mut rx) = mpsc::channel::<String>(32);
                let start = Instant::now();
                let payload = &request.payload;
                let stages_fut = async {
                    let tx = tx;
                    orchestrator.run_stages_4_to_6(payload, &tx, start).await
                    // `tx` drops here, closing the channel so `drain_fut` below terminates.
                };
                let drain_fut = async {
                    let mut lines = Vec::new();
                    while let Some(line) = rx.recv().await {
                        lines.push(line);
                    }
                    lines
                };
                let (outcome, lines) = tokio::join!(stages_fut, drain_fut);

                pool.release(&request.payload.user_id, &request.payload.thread_id).await;

                for line in lines {
                    let _ = kv.publish(&channel, &line).await;
                }
                match outcome {
                    Ok(()) => {
                        let _ = kv.publish(&channel, "SIGNAL:DONE").await;
                    }
                    Err(e) => {
                        let _ = kv.publish(&channel, &format!("SIGNAL:ERROR:{e}")).await;
                    }
                }
                bus.acknowledge(&message.id).await?;
            }
            Err(GatewayError::ConnectionPoolExhausted | GatewayError::UserConnectionLimit) => {
                if request.retry_count >= max_retries {
                    let _ = kv.publish(&channel, "SIGNAL:ERROR:Max retries exceeded").await;
                    bus.acknowledge(&message.id).await?;
                    continue;
                }
                let delay_ms = base_delay_ms.saturating_mul(1 << request.retry_count.min(20)).min(5000);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                let mut retried = request;
                retried.retry_count += 1;
                bus.produce(&retried).await?;
                bus.acknowledge(&message.id).await?;
            }
            Err(e) => {
                let _ = kv.publish(&channel, &format!("SIGNAL:ERROR:{e}")).await;
                bus.acknowledge(&message.id).await?;
            }
        }
    }

    Ok(count)
}
