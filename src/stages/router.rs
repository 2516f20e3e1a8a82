use crate::stats::PipelineStats;
use crate::types::Frame;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Single consumer of the shared frame channel. Counts every frame that
/// arrives and forwards it into the detection channel, dropping when
/// detection is backlogged rather than ever blocking the ingestors.
pub struct FrameRouter {
    frame_rx: mpsc::Receiver<Frame>,
    detection_tx: mpsc::Sender<Frame>,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
}

impl FrameRouter {
    pub fn new(
        frame_rx: mpsc::Receiver<Frame>,
        detection_tx: mpsc::Sender<Frame>,
        stats: Arc<PipelineStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            frame_rx,
            detection_tx,
            stats,
            cancel,
        }
    }

    pub async fn run(mut self) {
        info!("Frame router started");
        while !self.cancel.is_cancelled() {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = tokio::time::timeout(RECV_TIMEOUT, self.frame_rx.recv()) => {
                    match received {
                        Ok(Some(frame)) => frame,
                        // All ingestors gone; nothing left to route.
                        Ok(None) => break,
                        Err(_) => continue,
                    }
                }
            };

            self.stats.record_frame_received();
            match self.detection_tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.stats.record_frame_dropped();
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Detection channel closed, router exiting");
                    break;
                }
            }
        }
        info!("Frame router stopped");
    }
}
