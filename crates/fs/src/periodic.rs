//! Periodic background tasks
//!
//! Long-lived worker threads that run a closure on a fixed interval and
//! shut down gracefully. The metadata flusher (1 s) and the snapshot
//! scheduler (10 s) run on these.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::debug;

/// A background task ticking on a fixed interval
pub struct Periodic {
    shutdown: Arc<AtomicBool>,
    gate: Arc<(Mutex<()>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl Periodic {
    /// Start a task running `tick` every `interval`
    pub fn start(
        name: &'static str,
        interval: Duration,
        tick: impl Fn() + Send + 'static,
    ) -> Periodic {
        let shutdown = Arc::new(AtomicBool::new(false));
        let gate = Arc::new((Mutex::new(()), Condvar::new()));
        let t_shutdown = Arc::clone(&shutdown);
        let t_gate = Arc::clone(&gate);
        let handle = std::thread::spawn(move || {
            debug!(name, "periodic task up");
            loop {
                {
                    let mut guard = t_gate.0.lock();
                    if t_shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    let _ = t_gate.1.wait_for(&mut guard, interval);
                }
                if t_shutdown.load(Ordering::SeqCst) {
                    break;
                }
                tick();
            }
            debug!(name, "periodic task down");
        });
        Periodic {
            shutdown,
            gate,
            handle: Some(handle),
        }
    }

    /// Stop the task and wait for its thread to exit
    pub fn kill(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.gate.1.notify_all();
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for Periodic {
    fn drop(&mut self) {
        self.stop();
    }
}
