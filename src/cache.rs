use crate::types::{DetectionSet, Frame, StreamId, StreamResult};
use indexmap::IndexMap;
use std::sync::Mutex;

/// Most recent result per stream. The detection and analysis stages write
/// disjoint field groups, so each merge is a single short critical section
/// and readers only ever see whole entries.
///
/// No eviction: one entry per stream id ever seen, kept for the process
/// lifetime.
#[derive(Debug, Default)]
pub struct ResultCache {
    entries: Mutex<IndexMap<StreamId, StreamResult>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge the detection field group for a frame. An update carrying a
    /// sequence older than the cached one is ignored, so a slow batch
    /// cannot overwrite a newer frame's detections.
    pub fn update_detection(&self, frame: &Frame, detections: DetectionSet) {
        let mut entries = self.entries.lock().expect("result cache poisoned");
        match entries.get_mut(&frame.stream_id) {
            Some(entry) => {
                if frame.sequence < entry.last_sequence {
                    tracing::debug!(
                        stream = %frame.stream_id,
                        sequence = frame.sequence,
                        cached = entry.last_sequence,
                        "Ignoring stale detection update"
                    );
                    return;
                }
                entry.last_sequence = frame.sequence;
                entry.captured_at = frame.captured_at;
                entry.detection_summary = detections.summary();
                entry.detections = detections;
            }
            None => {
                entries.insert(
                    frame.stream_id.clone(),
                    StreamResult {
                        stream_id: frame.stream_id.clone(),
                        last_sequence: frame.sequence,
                        captured_at: frame.captured_at,
                        detection_summary: detections.summary(),
                        detections,
                        analysis: None,
                    },
                );
            }
        }
    }

    /// Merge the analysis text for a stream, preserving whatever detection
    /// fields the detection stage wrote last. Creates a bare entry if the
    /// stream has never been seen, which only happens in tests or if the
    /// detection write raced a restart.
    pub fn update_analysis(&self, frame: &Frame, analysis: String) {
        let mut entries = self.entries.lock().expect("result cache poisoned");
        match entries.get_mut(&frame.stream_id) {
            Some(entry) => entry.analysis = Some(analysis),
            None => {
                entries.insert(
                    frame.stream_id.clone(),
                    StreamResult {
                        stream_id: frame.stream_id.clone(),
                        last_sequence: frame.sequence,
                        captured_at: frame.captured_at,
                        detection_summary: String::new(),
                        detections: DetectionSet::default(),
                        analysis: Some(analysis),
                    },
                );
            }
        }
    }

    pub fn get(&self, stream_id: &StreamId) -> Option<StreamResult> {
        self.entries
            .lock()
            .expect("result cache poisoned")
            .get(stream_id)
            .cloned()
    }

    /// Full copy of all entries at one instant.
    pub fn snapshot(&self) -> IndexMap<StreamId, StreamResult> {
        self.entries.lock().expect("result cache poisoned").clone()
    }
}
