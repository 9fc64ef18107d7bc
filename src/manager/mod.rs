//! Automatic touchpad management.
//!
//! [`state::TouchpadManager`] holds the policy and decides; [`runner`] owns
//! the event queue, the monitors and the thread that touches the device.

pub mod runner;
pub mod state;

use crate::config::ManagementConfig;
use crate::discovery::{DeviceClass, InputDevice};
use crate::monitor::MonitorKind;
use crate::property::PropertyError;
use std::time::Instant;
use tracing::{error, info, warn};

/// Everything the manager reacts to, serialized through one queue.
#[derive(Debug)]
pub enum ManagerEvent {
    KeyActivity(Instant),
    MousePresence(bool),
    /// First touchpad present, `None` once the last one is gone.
    Touchpad(Option<InputDevice>),
    ConfigChanged(ManagementConfig),
    Suspend,
    Resume,
    SwitchFailed { off: bool, error: PropertyError },
    Report(Notification),
    Shutdown,
}

/// Recoverable failures and state changes surfaced to the outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    DeviceNotFound(DeviceClass),
    Switched { off: bool },
    SwitchFailed { off: bool, error: String },
    MonitorFailed {
        monitor: MonitorKind,
        error: String,
        persistent: bool,
    },
    ConfigRejected(String),
    TouchpadUnusable { name: String, error: String },
}

pub trait Observer: Send {
    fn notify(&self, notification: &Notification);
}

/// Observer that writes every notification to the log.
pub struct LogObserver;

impl Observer for LogObserver {
    fn notify(&self, notification: &Notification) {
        match notification {
            Notification::DeviceNotFound(class) => {
                warn!("no {} present, waiting for one to appear", class)
            }
            Notification::Switched { off } => {
                info!("touchpad {}", if *off { "disabled" } else { "enabled" })
            }
            Notification::SwitchFailed { off, error } => warn!(
                "failed to switch touchpad {}: {}",
                if *off { "off" } else { "on" },
                error
            ),
            Notification::MonitorFailed {
                monitor,
                error,
                persistent: true,
            } => error!("{} gave up: {}", monitor, error),
            Notification::MonitorFailed { monitor, error, .. } => {
                warn!("{} lost its event stream: {}", monitor, error)
            }
            Notification::ConfigRejected(reason) => {
                warn!("configuration rejected, keeping previous: {}", reason)
            }
            Notification::TouchpadUnusable { name, error } => {
                error!("cannot manage touchpad {}: {}", name, error)
            }
        }
    }
}
