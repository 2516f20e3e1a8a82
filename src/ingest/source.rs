use crate::config::StreamConfig;
use async_trait::async_trait;
use image::DynamicImage;

/// One physical live-video input. Implementations own transport and
/// decoding (RTSP, V4L, file playback); the pipeline only asks for the
/// next decoded frame.
///
/// Transient failures are reported through return values, never panics:
/// a failed `connect` returns `false`, a failed read returns `None`, and
/// the ingestor drives reconnects.
#[async_trait]
pub trait StreamSource: Send {
    async fn connect(&mut self) -> bool;

    /// Read the next decoded frame. `None` means the read failed or the
    /// stream stalled; it does not mean end-of-stream.
    async fn read_frame(&mut self) -> Option<DynamicImage>;

    async fn disconnect(&mut self);
}

/// Builds a source for a configured stream. The controller selects the
/// factory once at initialization; nothing downstream knows which
/// transport is behind it.
pub trait SourceFactory: Send + Sync {
    fn create(&self, config: &StreamConfig) -> Box<dyn StreamSource>;
}

impl<F> SourceFactory for F
where
    F: Fn(&StreamConfig) -> Box<dyn StreamSource> + Send + Sync,
{
    fn create(&self, config: &StreamConfig) -> Box<dyn StreamSource> {
        self(config)
    }
}
