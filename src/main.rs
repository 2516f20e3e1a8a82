use std::sync::Arc;
use std::time::Duration;

use image::{DynamicImage, Rgb, RgbImage};
use tracing::{error, info, Level};
use visionflow::config::StreamConfig;
use visionflow::{
    HttpDetectionProvider, OpenAiVlmProvider, PipelineConfig, PipelineController, PipelineError,
    StreamSource,
};

fn init_logging() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
}

/// Stand-in live source for the demo binary: emits a moving test pattern
/// at roughly 25 FPS. Production deployments implement [`StreamSource`]
/// over their actual transport (RTSP, V4L, ...).
struct SyntheticSource {
    tick: u32,
}

#[async_trait::async_trait]
impl StreamSource for SyntheticSource {
    async fn connect(&mut self) -> bool {
        true
    }

    async fn read_frame(&mut self) -> Option<DynamicImage> {
        tokio::time::sleep(Duration::from_millis(40)).await;
        self.tick = self.tick.wrapping_add(1);
        let tick = self.tick;
        let image = RgbImage::from_fn(320, 240, |x, y| {
            Rgb([(x + tick) as u8, (y + tick) as u8, (x ^ y) as u8])
        });
        Some(DynamicImage::ImageRgb8(image))
    }

    async fn disconnect(&mut self) {}
}

#[tokio::main]
async fn main() -> Result<(), PipelineError> {
    init_logging();

    let config_path = std::env::args().nth(1);
    let mut config = PipelineConfig::load(config_path.as_deref())?;
    if config.streams.is_empty() {
        info!("No streams configured, using two synthetic demo streams");
        config.streams = vec![
            StreamConfig {
                id: "camera1".to_string(),
                url: "synthetic://pattern1".to_string(),
                sample_rate: None,
            },
            StreamConfig {
                id: "camera2".to_string(),
                url: "synthetic://pattern2".to_string(),
                sample_rate: None,
            },
        ];
    }

    let detection = Arc::new(HttpDetectionProvider::new(
        config.detection.endpoint.clone(),
        config.detection.confidence_threshold,
        config.detection.request_timeout_secs,
    )?);

    let mut builder = PipelineController::builder()
        .config(config.clone())
        .source_factory(|_: &StreamConfig| {
            Box::new(SyntheticSource { tick: 0 }) as Box<dyn StreamSource>
        })
        .detection_provider(detection);
    if let Some(vlm_config) = &config.vlm {
        builder = builder.vlm_provider(Arc::new(OpenAiVlmProvider::new(vlm_config)?));
    }
    let mut controller = builder.build()?;

    controller.initialize().await?;
    controller.start()?;

    let mut stats_interval = tokio::time::interval(Duration::from_secs(10));
    stats_interval.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = stats_interval.tick() => {
                let stats = controller.stats();
                info!(
                    received = stats.frames_received,
                    detected = stats.frames_detected,
                    analyzed = stats.frames_analyzed,
                    dropped = stats.frames_dropped,
                    errors = stats.errors,
                    "Pipeline stats"
                );
                for (stream_id, result) in controller.latest_results() {
                    info!(
                        stream = %stream_id,
                        sequence = result.last_sequence,
                        "{} | {}",
                        result.detection_summary,
                        result.analysis.as_deref().unwrap_or("(not analyzed yet)")
                    );
                }
            }
        }
    }

    info!("Shutting down");
    controller.stop().await;
    let stats = controller.stats();
    if stats.errors > 0 {
        error!(errors = stats.errors, "Pipeline finished with errors");
    }
    Ok(())
}
