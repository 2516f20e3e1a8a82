use crate::cache::ResultCache;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::ingest::{SourceFactory, StreamRegistry, StreamStatus};
use crate::providers::{DetectionProvider, VlmProvider};
use crate::stages::{AnalysisStage, DetectionStage, FrameRouter};
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::types::{Frame, StreamId, StreamResult};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Initialized,
    Running,
    Stopped,
}

impl PipelineState {
    fn name(self) -> &'static str {
        match self {
            PipelineState::Created => "Created",
            PipelineState::Initialized => "Initialized",
            PipelineState::Running => "Running",
            PipelineState::Stopped => "Stopped",
        }
    }
}

/// Owns the whole pipeline: registry, stage workers, cache and counters.
/// Lifecycle is `Created -> Initialized -> Running -> Stopped`;
/// `initialize` may be called again after `stop`, which resets counters
/// and cache for the new run.
pub struct PipelineController {
    config: PipelineConfig,
    source_factory: Box<dyn SourceFactory>,
    detection_provider: Arc<dyn DetectionProvider>,
    vlm_provider: Option<Arc<dyn VlmProvider>>,
    state: PipelineState,
    stats: Arc<PipelineStats>,
    cache: Arc<ResultCache>,
    cancel: CancellationToken,
    registry: Option<StreamRegistry>,
    frame_rx: Option<mpsc::Receiver<Frame>>,
    workers: Vec<JoinHandle<()>>,
}

impl PipelineController {
    pub fn builder() -> PipelineControllerBuilder {
        PipelineControllerBuilder::default()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Wire the registry and check provider reachability. Misconfiguration
    /// is fatal here and leaves the state untouched; an unreachable
    /// provider is not, since per-call failure handling covers it.
    pub async fn initialize(&mut self) -> Result<(), PipelineError> {
        if self.state == PipelineState::Running {
            return Err(PipelineError::InvalidState {
                action: "initialize",
                state: self.state.name(),
            });
        }
        self.config.validate()?;

        if !self.detection_provider.check_health().await {
            warn!("Detection provider is not reachable yet; batches will fail until it is");
        }
        match &self.vlm_provider {
            Some(vlm) if !vlm.check_health().await => {
                warn!("VLM provider is not reachable yet; analysis will fail until it is");
            }
            Some(_) => {}
            None => info!("No VLM configured, running in detection-only mode"),
        }

        // Fresh counters, cache and stop signal for this run.
        let stats = Arc::new(PipelineStats::new());
        let (frame_tx, frame_rx) = mpsc::channel(self.config.channels.frame_capacity);
        let mut registry =
            StreamRegistry::new(frame_tx, self.config.sample_rate, Arc::clone(&stats));
        for stream in &self.config.streams {
            let source = self.source_factory.create(stream);
            registry.add(StreamId::new(&stream.id), source, stream.sample_rate)?;
        }

        self.stats = stats;
        self.cache = Arc::new(ResultCache::new());
        self.cancel = CancellationToken::new();
        self.registry = Some(registry);
        self.frame_rx = Some(frame_rx);
        self.state = PipelineState::Initialized;
        info!(
            streams = self.config.streams.len(),
            "Pipeline initialized"
        );
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), PipelineError> {
        if self.state == PipelineState::Running {
            warn!("Pipeline already running");
            return Ok(());
        }
        if self.state != PipelineState::Initialized {
            return Err(PipelineError::InvalidState {
                action: "start",
                state: self.state.name(),
            });
        }
        let registry = self.registry.as_mut().expect("initialized without registry");
        let frame_rx = self.frame_rx.take().expect("initialized without frame channel");

        let (detection_tx, detection_rx) =
            mpsc::channel(self.config.channels.detection_capacity);
        let router = FrameRouter::new(
            frame_rx,
            detection_tx,
            Arc::clone(&self.stats),
            self.cancel.child_token(),
        );
        self.workers.push(tokio::spawn(router.run()));

        let analysis_tx = match &self.vlm_provider {
            Some(vlm) => {
                let (analysis_tx, analysis_rx) =
                    mpsc::channel(self.config.channels.analysis_capacity);
                let request_timeout = self
                    .config
                    .vlm
                    .as_ref()
                    .map(|vlm| vlm.request_timeout_secs)
                    .unwrap_or(30);
                let analysis = AnalysisStage::new(
                    analysis_rx,
                    Arc::clone(vlm),
                    Arc::clone(&self.cache),
                    Duration::from_secs(request_timeout),
                    Arc::clone(&self.stats),
                    self.cancel.child_token(),
                );
                self.workers.push(tokio::spawn(analysis.run()));
                Some(analysis_tx)
            }
            None => None,
        };

        let detection = DetectionStage::new(
            detection_rx,
            Arc::clone(&self.detection_provider),
            Arc::clone(&self.cache),
            analysis_tx,
            self.config.detection.batch_size,
            Duration::from_millis(self.config.detection.batch_timeout_ms),
            Duration::from_secs(self.config.detection.request_timeout_secs),
            Arc::clone(&self.stats),
            self.cancel.child_token(),
        );
        self.workers.push(tokio::spawn(detection.run()));

        registry.start_all()?;
        self.state = PipelineState::Running;
        info!("Pipeline started");
        Ok(())
    }

    /// Stop every worker, best-effort and bounded. Calling `stop` when not
    /// running is a no-op.
    pub async fn stop(&mut self) {
        if self.state != PipelineState::Running {
            return;
        }
        info!("Stopping pipeline");
        self.cancel.cancel();
        if let Some(registry) = self.registry.as_mut() {
            registry.stop_all().await;
        }
        for worker in self.workers.drain(..) {
            if tokio::time::timeout(WORKER_JOIN_TIMEOUT, worker).await.is_err() {
                warn!("Pipeline worker did not stop in time");
            }
        }
        self.state = PipelineState::Stopped;
        info!("Pipeline stopped");
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn latest_results(&self) -> IndexMap<StreamId, StreamResult> {
        self.cache.snapshot()
    }

    pub fn stream_status(&self) -> HashMap<StreamId, StreamStatus> {
        self.registry
            .as_ref()
            .map(|registry| registry.status())
            .unwrap_or_default()
    }
}

/// Explicit wiring of providers and sources into the controller. No
/// global state: everything the pipeline talks to comes through here.
#[derive(Default)]
pub struct PipelineControllerBuilder {
    config: Option<PipelineConfig>,
    source_factory: Option<Box<dyn SourceFactory>>,
    detection_provider: Option<Arc<dyn DetectionProvider>>,
    vlm_provider: Option<Arc<dyn VlmProvider>>,
}

impl PipelineControllerBuilder {
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn source_factory(mut self, factory: impl SourceFactory + 'static) -> Self {
        self.source_factory = Some(Box::new(factory));
        self
    }

    pub fn detection_provider(mut self, provider: Arc<dyn DetectionProvider>) -> Self {
        self.detection_provider = Some(provider);
        self
    }

    pub fn vlm_provider(mut self, provider: Arc<dyn VlmProvider>) -> Self {
        self.vlm_provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<PipelineController, PipelineError> {
        let config = self
            .config
            .ok_or_else(|| PipelineError::Config("configuration not set".to_string()))?;
        let source_factory = self
            .source_factory
            .ok_or_else(|| PipelineError::Config("source factory not set".to_string()))?;
        let detection_provider = self
            .detection_provider
            .ok_or_else(|| PipelineError::Config("detection provider not set".to_string()))?;
        Ok(PipelineController {
            config,
            source_factory,
            detection_provider,
            vlm_provider: self.vlm_provider,
            state: PipelineState::Created,
            stats: Arc::new(PipelineStats::new()),
            cache: Arc::new(ResultCache::new()),
            cancel: CancellationToken::new(),
            registry: None,
            frame_rx: None,
            workers: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StreamConfig;
    use crate::error::ProviderError;
    use crate::ingest::StreamSource;
    use crate::types::DetectionSet;
    use async_trait::async_trait;
    use image::DynamicImage;

    struct SteadySource;

    #[async_trait]
    impl StreamSource for SteadySource {
        async fn connect(&mut self) -> bool {
            true
        }

        async fn read_frame(&mut self) -> Option<DynamicImage> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Some(DynamicImage::new_rgb8(4, 4))
        }

        async fn disconnect(&mut self) {}
    }

    struct PersonDetector;

    #[async_trait]
    impl DetectionProvider for PersonDetector {
        async fn detect(
            &self,
            images: &[&DynamicImage],
        ) -> Result<Vec<DetectionSet>, ProviderError> {
            Ok(images
                .iter()
                .map(|_| DetectionSet {
                    boxes: vec![[0.0, 0.0, 2.0, 2.0]],
                    scores: vec![0.9],
                    labels: vec!["person".to_string()],
                })
                .collect())
        }

        async fn check_health(&self) -> bool {
            true
        }
    }

    struct EchoVlm;

    #[async_trait]
    impl VlmProvider for EchoVlm {
        async fn analyze(
            &self,
            _image: &DynamicImage,
            _prompt: &str,
        ) -> Result<String, ProviderError> {
            Ok("A person in the frame.".to_string())
        }

        async fn check_health(&self) -> bool {
            true
        }
    }

    fn config(stream_ids: &[&str]) -> PipelineConfig {
        PipelineConfig {
            streams: stream_ids
                .iter()
                .map(|id| StreamConfig {
                    id: id.to_string(),
                    url: format!("rtsp://example/{id}"),
                    sample_rate: None,
                })
                .collect(),
            sample_rate: 0.0,
            ..PipelineConfig::default()
        }
    }

    fn controller(config: PipelineConfig, with_vlm: bool) -> PipelineController {
        let builder = PipelineController::builder()
            .config(config)
            .source_factory(|_: &StreamConfig| Box::new(SteadySource) as Box<dyn StreamSource>)
            .detection_provider(Arc::new(PersonDetector));
        let builder = if with_vlm {
            builder.vlm_provider(Arc::new(EchoVlm))
        } else {
            builder
        };
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn initialize_rejects_missing_streams_without_state_change() {
        let mut controller = controller(config(&[]), true);
        let err = controller.initialize().await.unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert_eq!(controller.state(), PipelineState::Created);
        assert!(controller.start().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn full_pipeline_run_populates_cache_and_stats() {
        let mut controller = controller(config(&["camera1"]), true);
        controller.initialize().await.unwrap();
        assert_eq!(controller.state(), PipelineState::Initialized);

        controller.start().unwrap();
        assert_eq!(controller.state(), PipelineState::Running);

        tokio::time::sleep(Duration::from_secs(3)).await;
        controller.stop().await;
        assert_eq!(controller.state(), PipelineState::Stopped);

        let stats = controller.stats();
        assert!(stats.frames_received > 0);
        assert!(stats.frames_detected > 0);
        assert!(stats.frames_analyzed > 0);

        let results = controller.latest_results();
        let entry = &results[&StreamId::new("camera1")];
        assert_eq!(entry.detections.labels, vec!["person"]);
        assert_eq!(entry.analysis.as_deref(), Some("A person in the frame."));

        let status = controller.stream_status();
        assert!(status[&StreamId::new("camera1")].frame_count > 0);
        assert!(!status[&StreamId::new("camera1")].running);
    }

    #[tokio::test(start_paused = true)]
    async fn detection_only_mode_never_populates_analysis() {
        let mut controller = controller(config(&["camera1"]), false);
        controller.initialize().await.unwrap();
        controller.start().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        controller.stop().await;

        let results = controller.latest_results();
        let entry = &results[&StreamId::new("camera1")];
        assert!(!entry.detections.is_empty());
        assert!(entry.analysis.is_none());
        assert_eq!(controller.stats().frames_analyzed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn start_when_running_is_a_noop_and_stop_is_idempotent() {
        let mut controller = controller(config(&["camera1"]), true);
        controller.initialize().await.unwrap();
        controller.start().unwrap();
        // Second start warns, does not error, does not respawn.
        controller.start().unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        controller.stop().await;
        let stats_after_first_stop = controller.stats();

        controller.stop().await;
        assert_eq!(controller.stats(), stats_after_first_stop);
        assert_eq!(controller.state(), PipelineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn reinitialize_after_stop_resets_counters() {
        let mut controller = controller(config(&["camera1"]), true);
        controller.initialize().await.unwrap();
        controller.start().unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        controller.stop().await;
        assert!(controller.stats().frames_received > 0);

        controller.initialize().await.unwrap();
        assert_eq!(controller.stats(), StatsSnapshot::default());
        assert!(controller.latest_results().is_empty());
    }
}
