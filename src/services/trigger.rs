//! Named, independently configured timers that fire lifecycle ticks.
//!
//! Each timer runs on its own task: ticks of different timers may overlap,
//! ticks of one timer never do. A tick that outlives `tick_timeout` is
//! abandoned and whatever it already wrote stays written.

use std::{fmt, sync::Arc, time::Duration};

use futures::future::{BoxFuture, join_all};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};
use tokio::{sync::watch, time::sleep};
use tracing::{Instrument, debug, error, info, info_span, warn};
use validator::ValidationError;

use crate::{dao::storage::StoreError, error::TickError};

/// Interval between two ticks of a timer.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TimerInterval {
    /// Always the same delay.
    Fixed {
        /// Delay between ticks, in seconds.
        #[serde_as(as = "DurationSeconds<u64>")]
        every: Duration,
    },
    /// A fresh random delay in `[min, max]` before every tick.
    Window {
        /// Shortest delay, in seconds.
        #[serde_as(as = "DurationSeconds<u64>")]
        min: Duration,
        /// Longest delay, in seconds.
        #[serde_as(as = "DurationSeconds<u64>")]
        max: Duration,
    },
}

/// Schedule of one named timer.
#[serde_as]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerPolicy {
    /// Base interval.
    #[serde(flatten)]
    pub interval: TimerInterval,
    /// Extra random delay in `[0, jitter]` added to every interval.
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default)]
    pub jitter: Duration,
    /// Fire once immediately instead of waiting for the first interval.
    #[serde(default = "default_run_on_startup")]
    pub run_on_startup: bool,
}

fn default_run_on_startup() -> bool {
    true
}

impl TimerPolicy {
    /// Fixed interval without jitter, firing on startup.
    pub const fn fixed(every: Duration) -> Self {
        Self {
            interval: TimerInterval::Fixed { every },
            jitter: Duration::ZERO,
            run_on_startup: true,
        }
    }

    /// Delay before the next tick.
    pub fn next_delay(&self) -> Duration {
        let mut rng = rand::rng();
        let base = match self.interval {
            TimerInterval::Fixed { every } => every,
            TimerInterval::Window { min, max } if max > min => rng.random_range(min..=max),
            TimerInterval::Window { min, .. } => min,
        };
        if self.jitter.is_zero() {
            base
        } else {
            base + rng.random_range(Duration::ZERO..=self.jitter)
        }
    }
}

/// Reject zero intervals and inverted windows.
pub fn validate_timer(policy: &TimerPolicy) -> Result<(), ValidationError> {
    let valid = match policy.interval {
        TimerInterval::Fixed { every } => !every.is_zero(),
        TimerInterval::Window { min, max } => !min.is_zero() && min <= max,
    };
    if valid {
        Ok(())
    } else {
        let mut err = ValidationError::new("timer_interval");
        err.message = Some("timer interval must be positive with min <= max".into());
        Err(err)
    }
}

/// Which lifecycle operation a timer drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TickKind {
    /// Open a game if none is open.
    Open,
    /// Gather replies for the open game.
    Collect,
    /// Close the open game once due.
    Close,
}

impl TickKind {
    /// Timer name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            TickKind::Open => "open",
            TickKind::Collect => "collect",
            TickKind::Close => "close",
        }
    }
}

impl fmt::Display for TickKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Receiver of timer ticks. Ticks arrive at least once and may overlap.
pub trait TickHandler: Send + Sync + 'static {
    /// Run one tick of `kind`.
    fn on_tick(&self, kind: TickKind) -> BoxFuture<'static, Result<(), TickError>>;
}

/// Owns the named timers and fires them until shutdown.
pub struct TriggerDriver {
    handler: Arc<dyn TickHandler>,
    timers: Vec<(TickKind, TimerPolicy)>,
    tick_timeout: Duration,
}

impl TriggerDriver {
    /// Driver without timers.
    pub fn new(handler: Arc<dyn TickHandler>, tick_timeout: Duration) -> Self {
        Self {
            handler,
            timers: Vec::new(),
            tick_timeout,
        }
    }

    /// Register a timer firing `kind` according to `policy`.
    pub fn with_timer(mut self, kind: TickKind, policy: TimerPolicy) -> Self {
        self.timers.push((kind, policy));
        self
    }

    /// Registered timers.
    pub fn timers(&self) -> impl Iterator<Item = TickKind> + '_ {
        self.timers.iter().map(|(kind, _)| *kind)
    }

    /// Fire every timer until `shutdown` flips to `true`. An in-flight tick is
    /// allowed to finish.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let tasks = self.timers.into_iter().map(|(kind, policy)| {
            let handler = self.handler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(run_timer(handler, kind, policy, self.tick_timeout, shutdown))
        });
        for joined in join_all(tasks).await {
            if let Err(err) = joined {
                error!(error = %err, "timer task panicked");
            }
        }
        info!("all timers stopped");
    }
}

async fn run_timer(
    handler: Arc<dyn TickHandler>,
    kind: TickKind,
    policy: TimerPolicy,
    tick_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(timer = %kind, ?policy, "timer scheduled");
    let mut first = true;

    loop {
        if !(first && policy.run_on_startup) {
            let delay = policy.next_delay();
            debug!(timer = %kind, ?delay, "waiting for next tick");
            tokio::select! {
                _ = sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        first = false;
        if *shutdown.borrow() {
            break;
        }

        let span = info_span!("tick", timer = %kind);
        run_tick(handler.as_ref(), kind, tick_timeout)
            .instrument(span)
            .await;
    }
    info!(timer = %kind, "timer stopped");
}

async fn run_tick(handler: &dyn TickHandler, kind: TickKind, limit: Duration) {
    match tokio::time::timeout(limit, handler.on_tick(kind)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log_tick_error(kind, &err),
        Err(_) => warn!(?limit, "tick exceeded its time budget; abandoned"),
    }
}

/// Contention is expected, missing data is a bug, the rest is transient.
fn log_tick_error(kind: TickKind, err: &TickError) {
    match err {
        TickError::Store(StoreError::Conflict { .. }) => {
            info!(timer = %kind, error = %err, "tick lost a race to a concurrent actor");
        }
        TickError::Store(StoreError::NotFound { game_id, .. }) => {
            error!(timer = %kind, game_id = %game_id, error = %err, "tick referenced a missing game");
        }
        _ => warn!(timer = %kind, error = %err, "tick failed; waiting for the next one"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct Recorder {
        ticks: Mutex<Vec<TickKind>>,
        calls: AtomicU32,
    }

    impl TickHandler for Recorder {
        fn on_tick(&self, kind: TickKind) -> BoxFuture<'static, Result<(), TickError>> {
            self.ticks.lock().unwrap().push(kind);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                match call % 3 {
                    0 => Ok(()),
                    1 => Err(TickError::Store(StoreError::conflict("raced"))),
                    // Never finishes within the tick budget.
                    _ => {
                        sleep(Duration::from_secs(60)).await;
                        Ok(())
                    }
                }
            })
        }
    }

    fn count(recorder: &Recorder, kind: TickKind) -> usize {
        recorder
            .ticks
            .lock()
            .unwrap()
            .iter()
            .filter(|tick| **tick == kind)
            .count()
    }

    #[test]
    fn window_delays_stay_in_bounds() {
        let policy = TimerPolicy {
            interval: TimerInterval::Window {
                min: Duration::from_secs(10),
                max: Duration::from_secs(20),
            },
            jitter: Duration::from_secs(5),
            run_on_startup: false,
        };
        for _ in 0..100 {
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_secs(10) && delay <= Duration::from_secs(25));
        }
        assert_eq!(
            TimerPolicy::fixed(Duration::from_secs(3)).next_delay(),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn zero_and_inverted_intervals_are_invalid() {
        assert!(validate_timer(&TimerPolicy::fixed(Duration::ZERO)).is_err());
        let inverted = TimerPolicy {
            interval: TimerInterval::Window {
                min: Duration::from_secs(9),
                max: Duration::from_secs(3),
            },
            ..TimerPolicy::fixed(Duration::from_secs(1))
        };
        assert!(validate_timer(&inverted).is_err());
        assert!(validate_timer(&TimerPolicy::fixed(Duration::from_secs(1))).is_ok());
    }

    #[test]
    fn policy_reads_from_json() {
        let policy: TimerPolicy =
            serde_json::from_str(r#"{"mode": "window", "min": 60, "max": 120, "jitter": 5}"#)
                .unwrap();
        assert_eq!(
            policy.interval,
            TimerInterval::Window {
                min: Duration::from_secs(60),
                max: Duration::from_secs(120)
            }
        );
        assert_eq!(policy.jitter, Duration::from_secs(5));
        assert!(policy.run_on_startup);
    }

    #[tokio::test]
    async fn timers_survive_failures_and_stop_on_shutdown() {
        let recorder = Arc::new(Recorder::default());
        let driver = TriggerDriver::new(recorder.clone(), Duration::from_millis(20))
            .with_timer(TickKind::Close, TimerPolicy::fixed(Duration::from_millis(5)))
            .with_timer(
                TickKind::Open,
                TimerPolicy {
                    run_on_startup: false,
                    ..TimerPolicy::fixed(Duration::from_secs(3600))
                },
            );
        assert_eq!(
            driver.timers().collect::<Vec<_>>(),
            [TickKind::Close, TickKind::Open]
        );

        let (stop, shutdown) = watch::channel(false);
        let running = tokio::spawn(driver.run(shutdown));

        sleep(Duration::from_millis(300)).await;
        stop.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("driver stops after shutdown")
            .unwrap();

        // Conflicts and abandoned ticks did not stop the close timer.
        assert!(count(&recorder, TickKind::Close) >= 4);
        // The open timer waits a full interval before its first tick.
        assert_eq!(count(&recorder, TickKind::Open), 0);
    }
}
