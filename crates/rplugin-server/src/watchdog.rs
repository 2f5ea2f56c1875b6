//! Liveness watchdog for the audio-dispatch thread. Runs at `SCHED_FIFO`
//! priority 2 so a stuck realtime thread doesn't also starve the thread
//! meant to notice it's stuck, ticks once a second, and force-terminates
//! the process after `WATCHDOG_MISSED_TICKS` consecutive ticks with no
//! heartbeat.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rplugin_core::WATCHDOG_MISSED_TICKS;
use tracing::{error, warn};

const WATCHDOG_SCHED_PRIORITY: libc::c_int = 2;

/// `SCHED_FIFO` priority the realtime ring-dispatch thread runs at, one tier
/// below the watchdog so a hung dispatch thread can still be preempted and
/// noticed.
pub const RING_DISPATCH_SCHED_PRIORITY: libc::c_int = 1;

/// Shared heartbeat counter: the audio-dispatch thread bumps this once per
/// processed block; the watchdog thread compares it across ticks.
#[derive(Clone, Default)]
pub struct Heartbeat(Arc<AtomicU64>);

impl Heartbeat {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    pub fn pet(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Attempts to raise the calling thread to the given `SCHED_FIFO` priority.
/// Failure (e.g. running unprivileged) is logged and otherwise ignored; the
/// caller still runs, just without the scheduling guarantee. Shared by the
/// watchdog thread (priority 2) and the helper's realtime ring-dispatch
/// thread (priority 1, see [`RING_DISPATCH_SCHED_PRIORITY`]).
pub fn raise_to_realtime_priority(priority: libc::c_int) {
    // SAFETY: `param` is fully initialized before use; `pthread_self()`
    // always returns a valid handle to the calling thread.
    unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority;
        let rc = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if rc != 0 {
            warn!(rc, priority, "failed to raise thread to SCHED_FIFO priority");
        }
    }
}

/// Spawns the watchdog thread. `on_trip` is invoked once, from the watchdog
/// thread, the first time `WATCHDOG_MISSED_TICKS` consecutive ticks pass
/// with no heartbeat movement; it should force the audio thread down (the
/// server binds this to terminating the whole process, matching the
/// upstream behavior of killing a hung helper outright).
pub fn spawn(heartbeat: Heartbeat, on_trip: impl Fn() + Send + 'static) -> JoinHandle<()> {
    std::thread::spawn(move || {
        raise_to_realtime_priority(WATCHDOG_SCHED_PRIORITY);
        let mut last_seen = heartbeat.get();
        let mut missed = 0u32;
        loop {
            std::thread::sleep(Duration::from_secs(1));
            let current = heartbeat.get();
            if current == last_seen {
                missed += 1;
            } else {
                missed = 0;
                last_seen = current;
            }
            if missed >= WATCHDOG_MISSED_TICKS {
                error!(
                    missed_ticks = missed,
                    "audio dispatch thread missed too many heartbeats, terminating"
                );
                on_trip();
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn heartbeat_pet_advances_counter() {
        let hb = Heartbeat::new();
        assert_eq!(hb.get(), 0);
        hb.pet();
        hb.pet();
        assert_eq!(hb.get(), 2);
    }

    #[test]
    fn clone_shares_the_same_counter() {
        let hb = Heartbeat::new();
        let clone = hb.clone();
        hb.pet();
        assert_eq!(clone.get(), 1);
    }

    #[test]
    fn trip_callback_fires_after_missed_ticks_when_driven_directly() {
        // Exercises the missed-tick accounting in isolation rather than
        // waiting on real 1-second sleeps.
        let tripped = Arc::new(AtomicBool::new(false));
        let tripped_clone = tripped.clone();
        let mut last_seen = 0u64;
        let mut missed = 0u32;
        let readings = [0u64; WATCHDOG_MISSED_TICKS as usize + 1];
        for &current in &readings {
            if current == last_seen {
                missed += 1;
            } else {
                missed = 0;
                last_seen = current;
            }
            if missed >= WATCHDOG_MISSED_TICKS {
                tripped_clone.store(true, Ordering::Relaxed);
                break;
            }
        }
        assert!(tripped.load(Ordering::Relaxed));
    }
}
