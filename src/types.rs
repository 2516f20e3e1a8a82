use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque key identifying one logical camera/stream. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(Arc<str>);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(Arc::from(id.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl Serialize for StreamId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for StreamId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Self::new(String::deserialize(deserializer)?))
    }
}

/// One sampled capture. Clones share the underlying pixel buffer.
#[derive(Clone)]
pub struct Frame {
    pub stream_id: StreamId,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub image: Arc<DynamicImage>,
    pub id: Uuid,
}

impl Frame {
    pub fn new(stream_id: StreamId, sequence: u64, image: DynamicImage) -> Self {
        Self {
            stream_id,
            sequence,
            captured_at: Utc::now(),
            image: Arc::new(image),
            id: Uuid::new_v4(),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("stream_id", &self.stream_id)
            .field("sequence", &self.sequence)
            .field("captured_at", &self.captured_at)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Object detection output for one frame. The three lists are parallel;
/// an empty set means nothing scored above the confidence threshold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionSet {
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    pub labels: Vec<String>,
}

impl DetectionSet {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    /// Labels with duplicates removed, keeping first-appearance order.
    pub fn distinct_labels(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for label in &self.labels {
            if !seen.contains(&label.as_str()) {
                seen.push(label.as_str());
            }
        }
        seen
    }

    /// Human-readable summary, e.g. "Detected: 2 persons, 1 car".
    pub fn summary(&self) -> String {
        if self.labels.is_empty() {
            return "No objects detected".to_string();
        }
        let mut counts: Vec<(&str, usize)> = Vec::new();
        for label in &self.labels {
            match counts.iter_mut().find(|(name, _)| *name == label.as_str()) {
                Some((_, count)) => *count += 1,
                None => counts.push((label.as_str(), 1)),
            }
        }
        counts.sort_by(|a, b| b.1.cmp(&a.1));
        let items: Vec<String> = counts
            .iter()
            .map(|(name, count)| {
                if *count > 1 {
                    format!("{} {}s", count, name)
                } else {
                    format!("1 {}", name)
                }
            })
            .collect();
        format!("Detected: {}", items.join(", "))
    }
}

/// A frame with its detection results attached.
#[derive(Debug, Clone)]
pub struct DetectedFrame {
    pub frame: Frame,
    pub detections: DetectionSet,
}

/// Latest known state for one stream, merged from the detection and
/// analysis stages. `analysis` stays `None` until the VLM has answered
/// at least once; an error-tagged string means the last attempt failed.
#[derive(Debug, Clone, Serialize)]
pub struct StreamResult {
    pub stream_id: StreamId,
    pub last_sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub detection_summary: String,
    pub detections: DetectionSet,
    pub analysis: Option<String>,
}
