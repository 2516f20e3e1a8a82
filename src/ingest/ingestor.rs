use crate::ingest::source::StreamSource;
use crate::stats::PipelineStats;
use crate::types::{Frame, StreamId};
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const MAX_CONNECT_ATTEMPTS: u32 = 5;
const ATTEMPT_WINDOW_PAUSE: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_READ_ERRORS: u64 = 10;
const READ_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Live counters for one ingestor, shared with the registry for status
/// reporting.
#[derive(Debug, Default)]
pub struct IngestorStatus {
    connected: AtomicBool,
    running: AtomicBool,
    frame_count: AtomicU64,
    error_count: AtomicU64,
}

impl IngestorStatus {
    pub fn snapshot(&self) -> StreamStatus {
        StreamStatus {
            connected: self.connected.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            frame_count: self.frame_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time status for one stream.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StreamStatus {
    pub connected: bool,
    pub running: bool,
    pub frame_count: u64,
    pub error_count: u64,
}

/// Wraps one [`StreamSource`], samples frames at the configured rate and
/// publishes them into the shared frame channel. Owns reconnect policy;
/// never exits on source failure, only on cancellation.
pub struct StreamIngestor {
    stream_id: StreamId,
    source: Box<dyn StreamSource>,
    sample_interval: Option<Duration>,
    frame_tx: mpsc::Sender<Frame>,
    stats: Arc<PipelineStats>,
    status: Arc<IngestorStatus>,
    cancel: CancellationToken,
}

impl StreamIngestor {
    pub fn new(
        stream_id: StreamId,
        source: Box<dyn StreamSource>,
        sample_rate: f64,
        frame_tx: mpsc::Sender<Frame>,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self {
        let sample_interval = if sample_rate > 0.0 {
            Some(Duration::from_secs_f64(1.0 / sample_rate))
        } else {
            None
        };
        Self {
            stream_id,
            source,
            sample_interval,
            frame_tx,
            stats,
            status: Arc::new(IngestorStatus::default()),
            cancel,
        }
    }

    pub fn status_handle(&self) -> Arc<IngestorStatus> {
        Arc::clone(&self.status)
    }

    pub async fn run(mut self) {
        info!(stream = %self.stream_id, "Ingestor started");
        self.status.running.store(true, Ordering::Relaxed);

        let mut connect_attempts: u32 = 0;
        let mut consecutive_read_errors: u64 = 0;
        let mut sequence: u64 = 0;
        let mut last_published: Option<Instant> = None;

        while !self.cancel.is_cancelled() {
            if !self.status.connected.load(Ordering::Relaxed) {
                if connect_attempts >= MAX_CONNECT_ATTEMPTS {
                    warn!(
                        stream = %self.stream_id,
                        "Max reconnect attempts reached, pausing before next window"
                    );
                    if !pause(&self.cancel, ATTEMPT_WINDOW_PAUSE).await {
                        break;
                    }
                    connect_attempts = 0;
                    continue;
                }
                if self.source.connect().await {
                    info!(stream = %self.stream_id, "Connected");
                    self.status.connected.store(true, Ordering::Relaxed);
                    connect_attempts = 0;
                    consecutive_read_errors = 0;
                } else {
                    connect_attempts += 1;
                    let delay = backoff_delay(connect_attempts);
                    warn!(
                        stream = %self.stream_id,
                        attempt = connect_attempts,
                        "Connect failed, retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    if !pause(&self.cancel, delay).await {
                        break;
                    }
                }
                continue;
            }

            // A stalled source read must not outlive a stop request.
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = self.source.read_frame() => read,
            };
            let Some(image) = read else {
                consecutive_read_errors += 1;
                self.status.error_count.fetch_add(1, Ordering::Relaxed);
                if consecutive_read_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                    warn!(stream = %self.stream_id, "Too many read failures, reconnecting");
                    self.source.disconnect().await;
                    self.status.connected.store(false, Ordering::Relaxed);
                    consecutive_read_errors = 0;
                } else if !pause(&self.cancel, READ_ERROR_PAUSE).await {
                    break;
                }
                continue;
            };
            consecutive_read_errors = 0;

            // Sampling: if the configured interval has not elapsed yet,
            // wait out the remainder and go read a fresher frame instead
            // of publishing this one.
            if let (Some(interval), Some(last)) = (self.sample_interval, last_published) {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    if !pause(&self.cancel, interval - elapsed).await {
                        break;
                    }
                    continue;
                }
            }
            last_published = Some(Instant::now());

            sequence += 1;
            self.status.frame_count.fetch_add(1, Ordering::Relaxed);
            let frame = Frame::new(self.stream_id.clone(), sequence, image);
            match self.frame_tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Backpressure valve: downstream is slower than the
                    // sample rate, drop and keep the source fresh.
                    self.stats.record_frame_dropped();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(stream = %self.stream_id, "Frame channel closed, stopping");
                    break;
                }
            }
        }

        self.source.disconnect().await;
        self.status.connected.store(false, Ordering::Relaxed);
        self.status.running.store(false, Ordering::Relaxed);
        info!(stream = %self.stream_id, "Ingestor stopped");
    }

}

/// Sleep that wakes early on cancellation. Returns `false` when the
/// ingestor should exit.
async fn pause(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Exponential backoff with ±20% jitter, capped at 30s after jitter.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << (attempt - 1).min(8));
    let jitter = rand::rng().random_range(0.8..1.2);
    exp.mul_f64(jitter).min(BACKOFF_CAP)
}
