//! Background sync loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::SyncEngine;

/// Loop control requests.
#[derive(Debug)]
enum LoopRequest {
    /// Run now instead of waiting for the next tick.
    Trigger,
    Shutdown,
}

/// Handle to a running sync loop.
///
/// Dropping the handle stops the loop after the current run.
pub struct SyncLoopHandle {
    request_tx: mpsc::Sender<LoopRequest>,
    task: JoinHandle<()>,
}

impl SyncLoopHandle {
    /// Request an immediate run. Coalesces with runs already queued.
    pub fn trigger(&self) {
        if self.request_tx.try_send(LoopRequest::Trigger).is_err() {
            debug!("Sync trigger coalesced with a pending request");
        }
    }

    /// Stop the loop, waiting for an in-flight run to finish.
    pub async fn shutdown(self) {
        let _ = self.request_tx.send(LoopRequest::Shutdown).await;
        if let Err(e) = self.task.await {
            error!("Sync loop task failed: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Spawn the loop on the current tokio runtime.
pub(crate) fn spawn(engine: Arc<SyncEngine>, period: Duration) -> SyncLoopHandle {
    let (request_tx, mut request_rx) = mpsc::channel(4);

    let task = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Sync loop started (every {:?})", period);

        loop {
            tokio::select! {
                request = request_rx.recv() => match request {
                    Some(LoopRequest::Trigger) => debug!("Sync requested"),
                    Some(LoopRequest::Shutdown) | None => break,
                },
                _ = ticker.tick() => debug!("Periodic sync tick"),
                _ = engine.wakeup().notified() => debug!("Sync loop woken"),
            }

            let result = engine.sync_once().await;
            if result.skipped {
                debug!("Sync skipped: {:?}", result.skip_reason);
            } else if let Some(err) = &result.error {
                // A failed run never stops the loop.
                warn!("Sync run failed: {}", err);
            } else {
                info!(
                    "Sync completed: {} pushed, {} pulled, {} failed, {} conflicts",
                    result.pushed, result.pulled, result.failed, result.conflicts
                );
            }
        }

        info!("Sync loop stopped");
    });

    SyncLoopHandle { request_tx, task }
}
