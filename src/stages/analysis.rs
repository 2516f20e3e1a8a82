use crate::cache::ResultCache;
use crate::error::ProviderError;
use crate::providers::VlmProvider;
use crate::stats::PipelineStats;
use crate::types::{DetectedFrame, DetectionSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Turns detected frames into natural-language scene descriptions via the
/// VLM provider. A failed call leaves an error-tagged text in the cache so
/// consumers can tell "analysis failed" from "not analyzed yet".
pub struct AnalysisStage {
    analysis_rx: mpsc::Receiver<DetectedFrame>,
    provider: Arc<dyn VlmProvider>,
    cache: Arc<ResultCache>,
    provider_timeout: Duration,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
}

impl AnalysisStage {
    pub fn new(
        analysis_rx: mpsc::Receiver<DetectedFrame>,
        provider: Arc<dyn VlmProvider>,
        cache: Arc<ResultCache>,
        provider_timeout: Duration,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            analysis_rx,
            provider,
            cache,
            provider_timeout,
            stats,
            cancel,
        }
    }

    pub async fn run(mut self) {
        info!("Analysis stage started");
        while !self.cancel.is_cancelled() {
            let detected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = tokio::time::timeout(RECV_TIMEOUT, self.analysis_rx.recv()) => {
                    match received {
                        Ok(Some(detected)) => detected,
                        Ok(None) => break,
                        Err(_) => continue,
                    }
                }
            };
            self.analyze(detected).await;
        }
        info!("Analysis stage stopped");
    }

    async fn analyze(&self, detected: DetectedFrame) {
        let prompt = build_prompt(&detected.detections);
        // Bound the call here as well; the provider's own HTTP timeout is
        // not something this stage can rely on.
        let outcome = tokio::time::timeout(
            self.provider_timeout,
            self.provider.analyze(&detected.frame.image, &prompt),
        )
        .await
        .unwrap_or(Err(ProviderError::Timeout(self.provider_timeout.as_secs())));
        let analysis = match outcome {
            Ok(text) => {
                info!(
                    stream = %detected.frame.stream_id,
                    "VLM: {}",
                    text.chars().take(100).collect::<String>()
                );
                text
            }
            Err(e) => {
                error!(stream = %detected.frame.stream_id, "VLM inference failed: {e}");
                self.stats.record_error();
                format!("Error: {e}")
            }
        };
        self.cache.update_analysis(&detected.frame, analysis);
        self.stats.record_frame_analyzed();
    }
}

/// Prompt listing the distinct detected labels; generic fallback when the
/// set is empty (should not happen given the detection stage filter, but
/// must not produce a broken prompt if it does).
fn build_prompt(detections: &DetectionSet) -> String {
    let labels = detections.distinct_labels();
    if labels.is_empty() {
        return "Describe what you see in this image.".to_string();
    }
    format!(
        "I detected the following objects: {}. Please describe the scene and what these objects are doing.",
        labels.join(", ")
    )
}
