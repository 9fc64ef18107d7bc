//! Event monitors turn device streams into manager signals.
//!
//! Every monitor runs on its own thread and only ever talks to the manager
//! through its event queue.

pub mod keyboard;
#[cfg(target_os = "linux")]
pub mod libinput_tap;
pub mod mouse;
pub mod touchpad;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// How long a monitor blocks on a device before checking for a stop request.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    Keyboard,
    Mouse,
    Touchpad,
}

impl fmt::Display for MonitorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorKind::Keyboard => write!(f, "keyboard monitor"),
            MonitorKind::Mouse => write!(f, "mouse monitor"),
            MonitorKind::Touchpad => write!(f, "touchpad monitor"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("seat {0} has no usable keyboard")]
    SeatUnavailable(String),

    #[error("failed to open {path}: {reason}")]
    OpenFailed { path: String, reason: String },

    #[error("read error: {0}")]
    ReadError(String),
}

#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// A running monitor thread. Dropping the handle asks the thread to stop
/// without waiting for it.
pub struct MonitorHandle {
    name: String,
    stop: StopFlag,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(StopFlag) + Send + 'static,
    {
        let name = name.into();
        let stop = StopFlag::default();
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(thread_stop));

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("failed to spawn {}: {}", name, e);
                None
            }
        };

        Self { name, stop, thread }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |t| !t.is_finished())
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.stop.set();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("{} panicked", self.name);
            }
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop.set();
    }
}
