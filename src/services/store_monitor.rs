use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, time::sleep};
use tracing::{info, warn};

use crate::{config::MonitorSettings, dao::game_store::GameStore};

const INITIAL_DELAY: Duration = Duration::from_millis(1_000);
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Ping the store and reconnect with backoff when it stops answering, until shutdown.
///
/// Ticks keep running meanwhile; their store calls fail fast and are retried
/// on the next tick.
pub async fn run(
    store: Arc<dyn GameStore>,
    settings: MonitorSettings,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut healthy = true;

    loop {
        let pause = match store.health_check().await {
            Ok(()) => {
                if !healthy {
                    info!("storage healthy again");
                    healthy = true;
                }
                settings.interval
            }
            Err(err) => {
                if healthy {
                    warn!(error = %err, "storage health check failed; reconnecting");
                }
                healthy = reconnect(store.as_ref(), settings.reconnect_attempts).await;
                if healthy {
                    settings.interval
                } else {
                    warn!("exhausted storage reconnect attempts; will check again");
                    MAX_DELAY
                }
            }
        };

        tokio::select! {
            _ = sleep(pause) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("storage monitor stopped");
}

async fn reconnect(store: &dyn GameStore, attempts: u32) -> bool {
    let mut delay = INITIAL_DELAY;
    for attempt in 1..=attempts {
        match store.try_reconnect().await {
            Ok(()) => {
                info!(attempt, "storage reconnection succeeded");
                return true;
            }
            Err(err) => {
                warn!(attempt, error = %err, "storage reconnect attempt failed");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
            }
        }
    }
    false
}
