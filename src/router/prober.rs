//! Periodic health probing of router endpoints.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use super::ConnectionRouter;

/// Handle to a running prober; dropping it does not stop the task, call
/// [`Prober::stop`].
pub struct Prober {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Prober {
    /// Probe every endpoint each `interval`, starting one interval from now.
    pub fn spawn(router: Arc<ConnectionRouter>, interval: Duration) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticks = IntervalStream::new(tokio::time::interval_at(start, interval));
            info!(interval_ms = interval.as_millis() as u64, "Health prober started");
            loop {
                tokio::select! {
                    tick = ticks.next() => {
                        if tick.is_none() {
                            break;
                        }
                        router.probe_all().await;
                        debug!("Probe round complete");
                    }
                    _ = stop.changed() => break,
                }
            }
            info!("Health prober stopped");
        });
        Self { shutdown, task }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
