//! Process-wide pause/stop control state (spec §3/§5/§9). A small object
//! with atomic flags plus a condition variable, passed by reference into
//! coordinators and the seeder listener, instead of a hidden global — so
//! tests can create an isolated instance per case.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct ControlState {
    paused: Mutex<bool>,
    cv: Condvar,
    stopped: AtomicBool,
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlState {
    pub fn new() -> Self {
        ControlState {
            paused: Mutex::new(false),
            cv: Condvar::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn pause(&self) {
        *self.paused.lock().unwrap() = true;
    }

    pub fn resume(&self) {
        *self.paused.lock().unwrap() = false;
        self.cv.notify_all();
    }

    /// Monotonic: once set, stays set until `reset`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cv.notify_all();
    }

    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        *self.paused.lock().unwrap() = false;
        self.cv.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap()
    }

    /// Blocks while paused. Returns `true` once unpaused (or if it was
    /// never paused), `false` if `stop` was observed during the wait.
    pub fn wait_if_paused(&self) -> bool {
        if self.is_stopped() {
            return false;
        }
        let mut guard = self.paused.lock().unwrap();
        while *guard {
            if self.is_stopped() {
                return false;
            }
            let (next, timeout) = self
                .cv
                .wait_timeout(guard, Duration::from_millis(100))
                .unwrap();
            guard = next;
            let _ = timeout;
        }
        !self.is_stopped()
    }
}
