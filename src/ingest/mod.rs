pub mod ingestor;
pub mod registry;
pub mod source;

pub use ingestor::{IngestorStatus, StreamIngestor, StreamStatus};
pub use registry::StreamRegistry;
pub use source::{SourceFactory, StreamSource};
