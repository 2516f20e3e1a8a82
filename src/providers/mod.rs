pub mod detection_http;
pub mod vlm_openai;

pub use detection_http::HttpDetectionProvider;
pub use vlm_openai::OpenAiVlmProvider;

use crate::error::ProviderError;
use crate::types::DetectionSet;
use async_trait::async_trait;
use image::DynamicImage;

/// Object detection backend. One implementation per backend, selected once
/// at initialization; the pipeline never branches on backend kind.
#[async_trait]
pub trait DetectionProvider: Send + Sync {
    /// Detect objects in a batch of images. The result has the same length
    /// and order as the input.
    async fn detect(&self, images: &[&DynamicImage]) -> Result<Vec<DetectionSet>, ProviderError>;

    async fn check_health(&self) -> bool;
}

/// Vision-language model backend.
#[async_trait]
pub trait VlmProvider: Send + Sync {
    /// Describe an image given a text prompt.
    async fn analyze(&self, image: &DynamicImage, prompt: &str) -> Result<String, ProviderError>;

    async fn check_health(&self) -> bool;
}
