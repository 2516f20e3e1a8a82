pub mod analysis;
pub mod detection;
pub mod router;

pub use analysis::AnalysisStage;
pub use detection::DetectionStage;
pub use router::FrameRouter;
