use crate::cache::ResultCache;
use crate::providers::DetectionProvider;
use crate::stats::PipelineStats;
use crate::types::{DetectedFrame, Frame};
use image::DynamicImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const BATCH_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Batches frames and runs them through the detection provider. Frames
/// with at least one detection move on to analysis; frames with none stop
/// here, which keeps VLM load bounded to interesting frames.
///
/// `analysis_tx: None` is detection-only mode: results are still cached,
/// nothing is forwarded.
pub struct DetectionStage {
    detection_rx: mpsc::Receiver<Frame>,
    provider: Arc<dyn DetectionProvider>,
    cache: Arc<ResultCache>,
    analysis_tx: Option<mpsc::Sender<DetectedFrame>>,
    batch_size: usize,
    batch_timeout: Duration,
    provider_timeout: Duration,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
}

impl DetectionStage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        detection_rx: mpsc::Receiver<Frame>,
        provider: Arc<dyn DetectionProvider>,
        cache: Arc<ResultCache>,
        analysis_tx: Option<mpsc::Sender<DetectedFrame>>,
        batch_size: usize,
        batch_timeout: Duration,
        provider_timeout: Duration,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            detection_rx,
            provider,
            cache,
            analysis_tx,
            batch_size: batch_size.max(1),
            batch_timeout,
            provider_timeout,
            stats,
            cancel,
        }
    }

    pub async fn run(mut self) {
        info!("Detection stage started");
        let mut batch: Vec<Frame> = Vec::with_capacity(self.batch_size);
        let mut batch_started: Option<Instant> = None;

        while !self.cancel.is_cancelled() {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = tokio::time::timeout(BATCH_POLL_TIMEOUT, self.detection_rx.recv()) => {
                    match received {
                        Ok(Some(frame)) => {
                            if batch.is_empty() {
                                batch_started = Some(Instant::now());
                            }
                            batch.push(frame);
                        }
                        Ok(None) => break,
                        // Poll timeout: fall through to the age check.
                        Err(_) => {}
                    }
                }
            }

            let batch_aged = batch_started
                .map(|started| started.elapsed() >= self.batch_timeout)
                .unwrap_or(false);
            if batch.len() >= self.batch_size || (!batch.is_empty() && batch_aged) {
                self.flush(std::mem::take(&mut batch)).await;
                batch_started = None;
            }
        }
        info!("Detection stage stopped");
    }

    async fn flush(&self, batch: Vec<Frame>) {
        let images: Vec<&DynamicImage> = batch.iter().map(|f| f.image.as_ref()).collect();
        // The trait contract makes no promise about the provider's own
        // timeouts; a hung call must not wedge this stage.
        let outcome =
            tokio::time::timeout(self.provider_timeout, self.provider.detect(&images)).await;
        let results = match outcome {
            Ok(Ok(sets)) if sets.len() == batch.len() => Some(sets),
            Ok(Ok(sets)) => {
                error!(
                    expected = batch.len(),
                    got = sets.len(),
                    "Detection provider returned wrong result count"
                );
                None
            }
            Ok(Err(e)) => {
                error!("Detection failed for batch of {}: {e}", batch.len());
                None
            }
            Err(_) => {
                error!(
                    "Detection timed out after {:.0}s for batch of {}",
                    self.provider_timeout.as_secs_f64(),
                    batch.len()
                );
                None
            }
        };

        // Attempted frames count toward frames_detected whether or not
        // the provider call succeeded.
        self.stats.record_frames_detected(batch.len() as u64);

        let Some(results) = results else {
            // Failed batch: one error, cache entries keep whatever they
            // had, nothing goes to analysis.
            self.stats.record_error();
            return;
        };

        for (frame, detections) in batch.into_iter().zip(results) {
            debug!(
                stream = %frame.stream_id,
                sequence = frame.sequence,
                "{}",
                detections.summary()
            );
            self.cache.update_detection(&frame, detections.clone());

            if detections.is_empty() {
                continue;
            }
            let Some(analysis_tx) = &self.analysis_tx else {
                continue;
            };
            match analysis_tx.try_send(DetectedFrame { frame, detections }) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.record_frame_dropped();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Analysis channel closed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::types::{DetectionSet, StreamId};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Provider that records batch sizes and replays scripted responses.
    struct MockDetector {
        batch_sizes: Mutex<Vec<usize>>,
        labels_per_frame: Vec<&'static str>,
        fail: bool,
        hang: bool,
    }

    impl MockDetector {
        fn detecting(labels: Vec<&'static str>) -> Self {
            Self {
                batch_sizes: Mutex::new(Vec::new()),
                labels_per_frame: labels,
                fail: false,
                hang: false,
            }
        }

        fn failing() -> Self {
            Self {
                batch_sizes: Mutex::new(Vec::new()),
                labels_per_frame: Vec::new(),
                fail: true,
                hang: false,
            }
        }

        fn hanging() -> Self {
            Self {
                batch_sizes: Mutex::new(Vec::new()),
                labels_per_frame: Vec::new(),
                fail: false,
                hang: true,
            }
        }
    }

    #[async_trait]
    impl DetectionProvider for MockDetector {
        async fn detect(
            &self,
            images: &[&DynamicImage],
        ) -> Result<Vec<DetectionSet>, ProviderError> {
            self.batch_sizes.lock().unwrap().push(images.len());
            if self.hang {
                std::future::pending::<()>().await;
            }
            if self.fail {
                return Err(ProviderError::InvalidResponse("scripted failure".into()));
            }
            Ok(images
                .iter()
                .map(|_| DetectionSet {
                    boxes: vec![[0.0; 4]; self.labels_per_frame.len()],
                    scores: vec![0.9; self.labels_per_frame.len()],
                    labels: self.labels_per_frame.iter().map(|l| l.to_string()).collect(),
                })
                .collect())
        }

        async fn check_health(&self) -> bool {
            true
        }
    }

    struct Harness {
        detection_tx: mpsc::Sender<Frame>,
        analysis_rx: mpsc::Receiver<DetectedFrame>,
        cache: Arc<ResultCache>,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
        task: tokio::task::JoinHandle<()>,
    }

    fn harness(provider: Arc<MockDetector>, analysis_capacity: usize) -> Harness {
        let (detection_tx, detection_rx) = mpsc::channel(16);
        let (analysis_tx, analysis_rx) = mpsc::channel(analysis_capacity);
        let cache = Arc::new(ResultCache::new());
        let stats = Arc::new(PipelineStats::new());
        let cancel = CancellationToken::new();
        let stage = DetectionStage::new(
            detection_rx,
            provider,
            Arc::clone(&cache),
            Some(analysis_tx),
            2,
            Duration::from_millis(500),
            Duration::from_secs(30),
            Arc::clone(&stats),
            cancel.clone(),
        );
        let task = tokio::spawn(stage.run());
        Harness {
            detection_tx,
            analysis_rx,
            cache,
            stats,
            cancel,
            task,
        }
    }

    fn frame(stream: &str, sequence: u64) -> Frame {
        Frame::new(StreamId::new(stream), sequence, DynamicImage::new_rgb8(4, 4))
    }

    #[tokio::test(start_paused = true)]
    async fn two_frames_within_window_make_one_batch_call() {
        let provider = Arc::new(MockDetector::detecting(vec!["person"]));
        let mut h = harness(Arc::clone(&provider), 8);

        h.detection_tx.send(frame("camera1", 1)).await.unwrap();
        h.detection_tx.send(frame("camera2", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(*provider.batch_sizes.lock().unwrap(), vec![2]);
        assert_eq!(h.stats.snapshot().frames_detected, 2);
        assert!(h.analysis_rx.recv().await.is_some());
        assert!(h.analysis_rx.recv().await.is_some());

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lone_frame_flushes_after_batch_timeout() {
        let provider = Arc::new(MockDetector::detecting(vec!["person"]));
        let h = harness(Arc::clone(&provider), 8);

        h.detection_tx.send(frame("camera1", 1)).await.unwrap();
        // Well past the 500ms batch timeout.
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*provider.batch_sizes.lock().unwrap(), vec![1]);
        assert_eq!(h.stats.snapshot().frames_detected, 1);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn empty_detections_are_cached_but_not_forwarded() {
        let provider = Arc::new(MockDetector::detecting(vec![]));
        let mut h = harness(provider, 8);

        h.detection_tx.send(frame("camera1", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.cancel.cancel();
        h.task.await.unwrap();

        let entry = h.cache.get(&StreamId::new("camera1")).unwrap();
        assert!(entry.detections.is_empty());
        assert_eq!(entry.detection_summary, "No objects detected");
        assert!(h.analysis_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_counts_one_error_and_keeps_cache_untouched() {
        let provider = Arc::new(MockDetector::failing());
        let mut h = harness(provider, 8);

        h.detection_tx.send(frame("camera1", 1)).await.unwrap();
        h.detection_tx.send(frame("camera2", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.cancel.cancel();
        h.task.await.unwrap();

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.frames_detected, 2);
        assert!(h.cache.get(&StreamId::new("camera1")).is_none());
        assert!(h.cache.get(&StreamId::new("camera2")).is_none());
        assert!(h.analysis_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn full_analysis_channel_is_a_counted_drop() {
        let provider = Arc::new(MockDetector::detecting(vec!["person"]));
        // Capacity 1 and nobody draining.
        let h = harness(provider, 1);

        for sequence in 1..=4 {
            h.detection_tx.send(frame("camera1", sequence)).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.cancel.cancel();
        h.task.await.unwrap();

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.frames_detected, 4);
        assert_eq!(snapshot.frames_dropped, 3);
        assert_eq!(snapshot.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_provider_call_times_out_instead_of_wedging_the_stage() {
        let provider = Arc::new(MockDetector::hanging());
        let mut h = harness(Arc::clone(&provider), 8);

        h.detection_tx.send(frame("camera1", 1)).await.unwrap();
        h.detection_tx.send(frame("camera2", 1)).await.unwrap();
        // Past the 30s provider timeout; the stage must move on.
        tokio::time::sleep(Duration::from_secs(31)).await;

        let snapshot = h.stats.snapshot();
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.frames_detected, 2);
        assert!(h.cache.get(&StreamId::new("camera1")).is_none());
        assert!(h.analysis_rx.try_recv().is_err());

        // And the next batch is still served.
        h.detection_tx.send(frame("camera1", 2)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*provider.batch_sizes.lock().unwrap(), vec![2, 1]);

        h.cancel.cancel();
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn detection_only_mode_caches_without_forwarding() {
        let provider = Arc::new(MockDetector::detecting(vec!["person"]));
        let (detection_tx, detection_rx) = mpsc::channel(16);
        let cache = Arc::new(ResultCache::new());
        let stats = Arc::new(PipelineStats::new());
        let cancel = CancellationToken::new();
        let stage = DetectionStage::new(
            detection_rx,
            provider,
            Arc::clone(&cache),
            None,
            2,
            Duration::from_millis(500),
            Duration::from_secs(30),
            Arc::clone(&stats),
            cancel.clone(),
        );
        let task = tokio::spawn(stage.run());

        detection_tx.send(frame("camera1", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        task.await.unwrap();

        let entry = cache.get(&StreamId::new("camera1")).unwrap();
        assert_eq!(entry.detections.labels, vec!["person"]);
        assert!(entry.analysis.is_none());
        assert_eq!(stats.snapshot().frames_dropped, 0);
    }
}
