//! Background housekeeping: expired cache entries and idle limiter subjects.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use super::Snapshot;
use crate::cache::store::CacheStore;
use crate::ratelimit::RateLimiter;

pub struct Sweeper {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Sweeper {
    pub(crate) fn spawn(
        store: Arc<CacheStore>,
        limiter: Arc<RateLimiter>,
        snapshot: Arc<ArcSwap<Snapshot>>,
        interval: Duration,
    ) -> Self {
        let (shutdown, mut stop) = watch::channel(false);
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticks = IntervalStream::new(tokio::time::interval_at(start, interval));
            loop {
                tokio::select! {
                    tick = ticks.next() => {
                        if tick.is_none() {
                            break;
                        }
                        let purged = store.purge_expired().await;
                        let idle = limiter.purge_idle(snapshot.load().idle_eviction);
                        if purged > 0 || idle > 0 {
                            info!(purged, idle_subjects = idle, "Sweep complete");
                        } else {
                            debug!("Sweep complete, nothing to drop");
                        }
                    }
                    _ = stop.changed() => break,
                }
            }
        });
        Self { shutdown, task }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
