use std::sync::Weak;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, instrument, trace, warn};

use crate::error::FmtCompact as _;
use crate::store::SessionStore;

const LOG_TARGET: &str = "console::session::pruner";

/// Background task periodically dropping expired sessions.
///
/// Holds the store weakly and ends once it is gone.
pub struct SessionPruner {
    store: Weak<dyn SessionStore>,
    interval: Duration,
}

impl SessionPruner {
    pub fn new(store: Weak<dyn SessionStore>, interval: Duration) -> Self {
        debug!(target: LOG_TARGET, ?interval, "Starting session pruner task");
        Self { store, interval }
    }

    #[instrument(name = "session-pruner", skip(self), ret)]
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            interval.tick().await;
            trace!(target: LOG_TARGET, "Woke up");

            let Some(store) = self.store.upgrade() else {
                debug!(target: LOG_TARGET, "Session store gone, quitting");
                break;
            };

            match store.prune().await {
                Ok(0) => {}
                Ok(pruned) => debug!(target: LOG_TARGET, pruned, "Pruned sessions"),
                Err(err) => {
                    warn!(target: LOG_TARGET, err = %err.fmt_compact(), "Session pruning failed");
                }
            }
        }
    }
}
