//! External triggers feeding [`StateCoordinator::handle_event`]
//!
//! Both sources poll and push [`SystemEvent`]s into one channel consumed by
//! the daemon loop:
//!
//! - [`WakeDetector`]: the monotonic clock stops while the machine sleeps and
//!   the wall clock does not, so a wall-clock gap larger than the monotonic
//!   one (plus a tolerance) means the machine just woke up.
//! - [`DisplayWatcher`]: re-enumerates active displays and reports any change
//!   to the set (hot-plug, mirroring, lid close).
//!
//! [`StateCoordinator::handle_event`]: crate::core::coordinator::StateCoordinator::handle_event

use crate::core::coordinator::SystemEvent;
use crate::core::gamma::{DisplayId, GammaDevice};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

pub const DEFAULT_WAKE_POLL: Duration = Duration::from_secs(5);
pub const DEFAULT_WAKE_TOLERANCE: Duration = Duration::from_secs(3);
pub const DEFAULT_DISPLAY_POLL: Duration = Duration::from_secs(2);

/// Whether the machine slept between two samples.
///
/// `wall_elapsed` is `None` when the wall clock moved backwards.
pub fn detect_sleep(
    wall_elapsed: Option<Duration>,
    mono_elapsed: Duration,
    tolerance: Duration,
) -> bool {
    wall_elapsed.is_some_and(|wall| wall > mono_elapsed + tolerance)
}

pub struct WakeDetector {
    interval: Duration,
    tolerance: Duration,
}

impl Default for WakeDetector {
    fn default() -> Self {
        Self::new(DEFAULT_WAKE_POLL, DEFAULT_WAKE_TOLERANCE)
    }
}

impl WakeDetector {
    pub fn new(interval: Duration, tolerance: Duration) -> Self {
        Self {
            interval,
            tolerance,
        }
    }

    /// Polls until the receiving side of `events` is dropped.
    pub fn spawn(self, events: mpsc::Sender<SystemEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut last_wall = SystemTime::now();
            let mut last_mono = Instant::now();
            loop {
                ticker.tick().await;
                let wall = SystemTime::now();
                let mono = Instant::now();

                let slept = detect_sleep(
                    wall.duration_since(last_wall).ok(),
                    mono.duration_since(last_mono),
                    self.tolerance,
                );
                last_wall = wall;
                last_mono = mono;

                if slept {
                    info!("Wake from sleep detected");
                    if events.send(SystemEvent::Wake).await.is_err() {
                        break;
                    }
                }
            }
        })
    }
}

/// Whether the set of active displays differs between two observations.
pub fn topology_changed(previous: &BTreeSet<DisplayId>, current: &BTreeSet<DisplayId>) -> bool {
    previous != current
}

pub struct DisplayWatcher {
    device: Arc<dyn GammaDevice>,
    interval: Duration,
}

impl DisplayWatcher {
    pub fn new(device: Arc<dyn GammaDevice>, interval: Duration) -> Self {
        Self { device, interval }
    }

    fn observe(&self) -> Option<BTreeSet<DisplayId>> {
        match self.device.active_displays() {
            Ok(displays) => Some(displays.into_iter().collect()),
            Err(e) => {
                debug!("Display poll failed: {e}");
                None
            }
        }
    }

    /// Polls until the receiving side of `events` is dropped.
    ///
    /// The first observation is the baseline and is never reported.
    pub fn spawn(self, events: mpsc::Sender<SystemEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let watcher = Arc::new(self);
            let mut ticker = tokio::time::interval(watcher.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut known: Option<BTreeSet<DisplayId>> = None;
            loop {
                ticker.tick().await;
                let poll = Arc::clone(&watcher);
                let Ok(Some(current)) = tokio::task::spawn_blocking(move || poll.observe()).await
                else {
                    continue;
                };

                let changed = known
                    .as_ref()
                    .is_some_and(|previous| topology_changed(previous, &current));
                known = Some(current);

                if changed {
                    info!("Display topology changed");
                    if events.send(SystemEvent::DisplaysChanged).await.is_err() {
                        break;
                    }
                }
            }
        })
    }
}
