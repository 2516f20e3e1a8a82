use crate::error::RegistryError;
use crate::ingest::ingestor::{IngestorStatus, StreamIngestor, StreamStatus};
use crate::ingest::source::StreamSource;
use crate::stats::PipelineStats;
use crate::types::{Frame, StreamId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct StreamEntry {
    // Taken when the ingestor task is spawned.
    ingestor: Option<StreamIngestor>,
    status: Arc<IngestorStatus>,
    task: Option<JoinHandle<()>>,
}

/// Owns the set of active stream ingestors: registration, start/stop of
/// all of them, and aggregated status.
pub struct StreamRegistry {
    streams: HashMap<StreamId, StreamEntry>,
    frame_tx: mpsc::Sender<Frame>,
    sample_rate: f64,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    running: bool,
}

impl StreamRegistry {
    pub fn new(
        frame_tx: mpsc::Sender<Frame>,
        sample_rate: f64,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            streams: HashMap::new(),
            frame_tx,
            sample_rate,
            stats,
            cancel: CancellationToken::new(),
            running: false,
        }
    }

    /// Register a stream. `sample_rate` overrides the registry-wide
    /// default for this stream only.
    pub fn add(
        &mut self,
        stream_id: StreamId,
        source: Box<dyn StreamSource>,
        sample_rate: Option<f64>,
    ) -> Result<(), RegistryError> {
        if self.streams.contains_key(&stream_id) {
            return Err(RegistryError::DuplicateStream(stream_id.to_string()));
        }
        let ingestor = StreamIngestor::new(
            stream_id.clone(),
            source,
            sample_rate.unwrap_or(self.sample_rate),
            self.frame_tx.clone(),
            Arc::clone(&self.stats),
            self.cancel.child_token(),
        );
        let status = ingestor.status_handle();
        self.streams.insert(
            stream_id,
            StreamEntry {
                ingestor: Some(ingestor),
                status,
                task: None,
            },
        );
        Ok(())
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn start_all(&mut self) -> Result<(), RegistryError> {
        if self.running {
            return Err(RegistryError::AlreadyStarted);
        }
        self.running = true;
        let mut started = 0;
        for entry in self.streams.values_mut() {
            if let Some(ingestor) = entry.ingestor.take() {
                entry.task = Some(tokio::spawn(ingestor.run()));
                started += 1;
            }
        }
        info!("Started {started} stream ingestor(s)");
        Ok(())
    }

    /// Signal every ingestor to stop and wait for each task, bounded per
    /// task. A task that does not exit in time is aborted so its source
    /// handle is dropped rather than leaked.
    pub async fn stop_all(&mut self) {
        self.cancel.cancel();
        for (stream_id, entry) in self.streams.iter_mut() {
            if let Some(mut task) = entry.task.take() {
                if tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut task)
                    .await
                    .is_err()
                {
                    warn!(stream = %stream_id, "Ingestor did not stop in time, aborting");
                    task.abort();
                }
            }
        }
        self.running = false;
        info!("All stream ingestors stopped");
    }

    /// Per-stream status snapshot.
    pub fn status(&self) -> HashMap<StreamId, StreamStatus> {
        self.streams
            .iter()
            .map(|(id, entry)| (id.clone(), entry.status.snapshot()))
            .collect()
    }
}
