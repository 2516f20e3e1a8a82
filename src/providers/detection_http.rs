use super::DetectionProvider;
use crate::error::ProviderError;
use crate::types::DetectionSet;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use image::DynamicImage;
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;

/// Client for the HTTP detection service (`POST /api/detect` with a
/// base64 JPEG, `GET /health`). The service scores one image per request,
/// so a batch call fans out sequentially; a single failed image fails the
/// whole batch and the detection stage handles that per its usual policy.
pub struct HttpDetectionProvider {
    client: reqwest::Client,
    base_url: String,
    confidence_threshold: f32,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    success: bool,
    #[serde(default)]
    detections: Vec<RemoteDetection>,
}

#[derive(Debug, Deserialize)]
struct RemoteDetection {
    name: String,
    confidence: f32,
    bbox: [f32; 4],
}

impl HttpDetectionProvider {
    pub fn new(
        base_url: impl Into<String>,
        confidence_threshold: f32,
        timeout_secs: u64,
    ) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            confidence_threshold,
            timeout_secs,
        })
    }

    async fn detect_one(&self, image: &DynamicImage) -> Result<DetectionSet, ProviderError> {
        let image_b64 = encode_jpeg_base64(image, 85)?;
        let response = self
            .client
            .post(format!("{}/api/detect", self.base_url))
            .json(&serde_json::json!({
                "image_base64": image_b64,
                "draw_boxes": false,
            }))
            .send()
            .await
            .map_err(|e| self.map_timeout(e))?
            .error_for_status()
            .map_err(ProviderError::Request)?;

        let body: DetectResponse = response.json().await.map_err(ProviderError::Request)?;
        if !body.success {
            return Err(ProviderError::InvalidResponse(
                "detection service reported failure".to_string(),
            ));
        }

        let mut detections = DetectionSet::default();
        for item in body.detections {
            if item.confidence < self.confidence_threshold {
                continue;
            }
            detections.boxes.push(item.bbox);
            detections.scores.push(item.confidence);
            detections.labels.push(item.name);
        }
        Ok(detections)
    }

    fn map_timeout(&self, e: reqwest::Error) -> ProviderError {
        if e.is_timeout() {
            ProviderError::Timeout(self.timeout_secs)
        } else {
            ProviderError::Request(e)
        }
    }
}

#[async_trait]
impl DetectionProvider for HttpDetectionProvider {
    async fn detect(&self, images: &[&DynamicImage]) -> Result<Vec<DetectionSet>, ProviderError> {
        let mut results = Vec::with_capacity(images.len());
        for image in images {
            results.push(self.detect_one(image).await?);
        }
        Ok(results)
    }

    async fn check_health(&self) -> bool {
        match self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::warn!("Detection service health check failed: {e}");
                false
            }
        }
    }
}

/// JPEG-encode an image and base64 it for a JSON payload.
pub(crate) fn encode_jpeg_base64(
    image: &DynamicImage,
    quality: u8,
) -> Result<String, ProviderError> {
    let mut bytes = Vec::new();
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(Cursor::new(&mut bytes), quality);
    // JPEG has no alpha channel; normalize to RGB first.
    DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)?;
    Ok(general_purpose::STANDARD.encode(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_image_is_valid_base64_jpeg() {
        let image = DynamicImage::new_rgb8(16, 16);
        let encoded = encode_jpeg_base64(&image, 85).unwrap();
        let decoded = general_purpose::STANDARD.decode(encoded).unwrap();
        // JPEG SOI marker
        assert_eq!(&decoded[..2], &[0xFF, 0xD8]);
    }
}
