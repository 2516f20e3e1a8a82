pub mod cache;
pub mod config;
pub mod controller;
pub mod error;
pub mod ingest;
pub mod providers;
pub mod stages;
pub mod stats;
pub mod types;

pub use cache::ResultCache;
pub use config::PipelineConfig;
pub use controller::{PipelineController, PipelineState};
pub use error::{PipelineError, ProviderError, RegistryError};
pub use ingest::{SourceFactory, StreamRegistry, StreamSource};
pub use providers::{DetectionProvider, HttpDetectionProvider, OpenAiVlmProvider, VlmProvider};
pub use stats::StatsSnapshot;
pub use types::{DetectedFrame, DetectionSet, Frame, StreamId, StreamResult};
