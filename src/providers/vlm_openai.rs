use super::detection_http::encode_jpeg_base64;
use super::VlmProvider;
use crate::config::VlmConfig;
use crate::error::ProviderError;
use async_trait::async_trait;
use image::DynamicImage;
use serde::Deserialize;
use std::time::Duration;

/// Images larger than this on either side get thumbnailed before upload.
const MAX_UPLOAD_DIMENSION: u32 = 1024;

/// Client for an OpenAI-compatible chat-completions endpoint serving a
/// vision-language model (e.g. vLLM). Sends the prompt plus the frame as
/// a JPEG data URL.
pub struct OpenAiVlmProvider {
    client: reqwest::Client,
    api_url: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

impl OpenAiVlmProvider {
    pub fn new(config: &VlmConfig) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout_secs: config.request_timeout_secs,
        })
    }

    fn encode_image(&self, image: &DynamicImage) -> Result<String, ProviderError> {
        let resized;
        let upload = if image.width() > MAX_UPLOAD_DIMENSION || image.height() > MAX_UPLOAD_DIMENSION
        {
            resized = image.thumbnail(MAX_UPLOAD_DIMENSION, MAX_UPLOAD_DIMENSION);
            &resized
        } else {
            image
        };
        Ok(format!(
            "data:image/jpeg;base64,{}",
            encode_jpeg_base64(upload, 85)?
        ))
    }
}

#[async_trait]
impl VlmProvider for OpenAiVlmProvider {
    async fn analyze(&self, image: &DynamicImage, prompt: &str) -> Result<String, ProviderError> {
        let image_data = self.encode_image(image)?;
        let payload = serde_json::json!({
            "model": self.model,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": prompt },
                    { "type": "image_url", "image_url": { "url": image_data } },
                ],
            }],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });

        let url = format!("{}/chat/completions", self.api_url);
        tracing::debug!(%url, prompt, "Calling VLM");

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout_secs)
                } else {
                    ProviderError::Request(e)
                }
            })?
            .error_for_status()
            .map_err(ProviderError::Request)?;

        let body: ChatResponse = response.json().await.map_err(ProviderError::Request)?;
        body.choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("response had no choices".to_string()))
    }

    async fn check_health(&self) -> bool {
        // vLLM exposes /health at the server root; fall back to the
        // OpenAI-style /models listing for other servers.
        let health_url = format!("{}/health", self.api_url.trim_end_matches("/v1"));
        if let Ok(response) = self
            .client
            .get(&health_url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            if response.status().is_success() {
                return true;
            }
        }
        match self
            .client
            .get(format!("{}/models", self.api_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::warn!("VLM health check failed: {e}");
                false
            }
        }
    }
}
