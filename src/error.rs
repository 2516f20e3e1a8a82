use thiserror::Error;

// Main pipeline error type

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Cannot {action} while pipeline is {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },
}

// Stream registry error type
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Stream '{0}' is already registered")]
    DuplicateStream(String),
    #[error("The registry is already running")]
    AlreadyStarted,
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("Request timed out after {0}s")]
    Timeout(u64),
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),
    #[error("Failed to encode image: {0}")]
    ImageEncoding(#[from] image::ImageError),
}
