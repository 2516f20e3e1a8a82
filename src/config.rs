use crate::error::PipelineError;
use serde::Deserialize;

/// One stream source entry: a logical id and its locator (e.g. an RTSP
/// url, possibly with credentials embedded).
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    pub url: String,
    /// Overrides the pipeline-wide `sample_rate` for this stream.
    #[serde(default)]
    pub sample_rate: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub endpoint: String,
    pub confidence_threshold: f32,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8001".to_string(),
            confidence_threshold: 0.5,
            batch_size: 2,
            batch_timeout_ms: 500,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VlmConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl Default for VlmConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/v1".to_string(),
            model: "Vintern-1B-v3_5".to_string(),
            max_tokens: 512,
            temperature: 0.7,
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub frame_capacity: usize,
    pub detection_capacity: usize,
    pub analysis_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            frame_capacity: 20,
            detection_capacity: 20,
            analysis_capacity: 10,
        }
    }
}

/// Full pipeline configuration. `vlm: None` runs the pipeline in detection
/// only mode: the analysis stage is never spawned and cached results keep
/// `analysis` empty.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub streams: Vec<StreamConfig>,
    /// Frames per second to sample from each stream; 0 means every frame.
    pub sample_rate: f64,
    pub detection: DetectionConfig,
    pub vlm: Option<VlmConfig>,
    pub channels: ChannelConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            sample_rate: 1.0,
            detection: DetectionConfig::default(),
            vlm: Some(VlmConfig::default()),
            channels: ChannelConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from an optional TOML file plus `VISIONFLOW_`-prefixed
    /// environment overrides (e.g. `VISIONFLOW_SAMPLE_RATE=2`).
    pub fn load(path: Option<&str>) -> Result<Self, PipelineError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder
            .add_source(config::Environment::with_prefix("VISIONFLOW").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| PipelineError::Config(e.to_string()))
    }

    /// Misconfiguration is fatal at initialize time; the pipeline must not
    /// reach Running with an unusable config.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.streams.is_empty() {
            return Err(PipelineError::Config(
                "at least one stream must be configured".to_string(),
            ));
        }
        for stream in &self.streams {
            if stream.id.trim().is_empty() {
                return Err(PipelineError::Config("stream id must not be empty".to_string()));
            }
            if stream.url.trim().is_empty() {
                return Err(PipelineError::Config(format!(
                    "stream '{}' has an empty source url",
                    stream.id
                )));
            }
            if let Some(rate) = stream.sample_rate {
                if rate < 0.0 {
                    return Err(PipelineError::Config(format!(
                        "stream '{}' sample_rate must be >= 0, got {}",
                        stream.id, rate
                    )));
                }
            }
        }
        if self.sample_rate < 0.0 {
            return Err(PipelineError::Config(format!(
                "sample_rate must be >= 0, got {}",
                self.sample_rate
            )));
        }
        let conf = self.detection.confidence_threshold;
        if !(0.0..=1.0).contains(&conf) || conf == 0.0 {
            return Err(PipelineError::Config(format!(
                "confidence_threshold must be in (0, 1], got {}",
                conf
            )));
        }
        if self.detection.batch_size == 0 {
            return Err(PipelineError::Config(
                "detection batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
