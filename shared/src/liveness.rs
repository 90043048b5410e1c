//! Keep-alive timers.
//!
//! [`Ping`] fires a probe callback on a fixed period. [`Watchdog`] watches
//! for silence: every successful exchange feeds it, and when no feed arrives
//! within the deadline it fires its timeout callback once, then re-arms for
//! the next silence window.

use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};

pub type ProbeFn = Arc<dyn Fn() + Send + Sync>;
pub type TimeoutFn = Arc<dyn Fn() + Send + Sync>;

/// Periodic probe driver. The callback is sync so it can be wired to queue
/// work (a broker enqueue) rather than perform I/O itself.
pub struct Ping {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Ping {
    /// Starts probing immediately. Must run inside a tokio runtime.
    pub fn start(period: Duration, probe: ProbeFn) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let handle = tokio::spawn(async move {
            while flag.load(Ordering::SeqCst) {
                probe();
                sleep(period).await;
            }
        });
        Self {
            running,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for Ping {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WatchdogState {
    deadline: Duration,
    last_feed: Mutex<Instant>,
    running: AtomicBool,
}

/// Silence detector. Fires `on_timeout` when [`Watchdog::feed`] has not been
/// called for the deadline, then treats the firing itself as a feed so a
/// persistent silence produces one callback per window, not a callback storm.
pub struct Watchdog {
    state: Arc<WatchdogState>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    /// Starts watching. Must run inside a tokio runtime.
    pub fn start(deadline: Duration, on_timeout: TimeoutFn) -> Self {
        let state = Arc::new(WatchdogState {
            deadline,
            last_feed: Mutex::new(Instant::now()),
            running: AtomicBool::new(true),
        });
        let shared = Arc::clone(&state);
        let handle = tokio::spawn(async move {
            while shared.running.load(Ordering::SeqCst) {
                let remaining = {
                    let last = *shared.last_feed.lock().unwrap();
                    shared.deadline.checked_sub(last.elapsed())
                };
                match remaining {
                    Some(wait) => sleep(wait).await,
                    None => {
                        warn!("watchdog expired after {:?} of silence", shared.deadline);
                        // Re-arm before the callback so a slow callback does
                        // not trigger an immediate second firing.
                        *shared.last_feed.lock().unwrap() = Instant::now();
                        on_timeout();
                    }
                }
            }
        });
        Self {
            state,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Resets the silence clock.
    pub fn feed(&self) {
        *self.state.last_feed.lock().unwrap() = Instant::now();
        debug!("watchdog fed");
    }

    pub fn stop(&self) {
        self.state.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}
