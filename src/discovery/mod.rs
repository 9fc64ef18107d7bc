#[cfg(target_os = "linux")]
pub mod udev_discovery;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Keyboard,
    Mouse,
    Touchpad,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Keyboard => write!(f, "keyboard"),
            DeviceClass::Mouse => write!(f, "mouse"),
            DeviceClass::Touchpad => write!(f, "touchpad"),
        }
    }
}

/// Stable handle of an input device for as long as it stays plugged in:
/// the sysfs path of its event node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(syspath: impl Into<String>) -> Self {
        Self(syspath.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hardware features of a device, probed once when it is discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub left_button: bool,
    pub middle_button: bool,
    pub right_button: bool,
    pub two_finger_detection: bool,
    pub three_finger_detection: bool,
    pub pressure_detection: bool,
    pub finger_width_detection: bool,
}

impl Capabilities {
    /// Number of fingers the device tells apart on a single touch.
    pub fn finger_detection(&self) -> u8 {
        1 + u8::from(self.two_finger_detection) + u8::from(self.three_finger_detection)
    }

    /// Older pads that cannot track two fingers can still fake it from
    /// pressure and finger width.
    pub fn has_two_finger_emulation(&self) -> bool {
        self.pressure_detection && self.finger_width_detection
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputDevice {
    pub id: DeviceId,
    pub name: String,
    pub class: DeviceClass,
    pub devnode: Option<PathBuf>,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Added(InputDevice),
    Removed(InputDevice),
}

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("udev error: {0}")]
    UdevError(String),

    #[error("no {0} found")]
    NotFound(DeviceClass),

    #[error("device event stream lost: {0}")]
    TransportLost(String),
}

/// Lazy stream of hot-plug events for one device class.
///
/// Dropping the stream unsubscribes.
pub trait HotplugStream {
    /// Waits up to `timeout` for the next event; `Ok(None)` when nothing
    /// arrived in time. An error means the stream is dead.
    fn next_event(&mut self, timeout: Duration) -> Result<Option<HotplugEvent>, DiscoveryError>;
}

pub trait DeviceRegistry: Send + Sync {
    /// Point-in-time snapshot of the devices of `class`.
    fn list(&self, class: DeviceClass) -> Result<Vec<InputDevice>, DiscoveryError>;

    /// Streams are created on the thread that reads them.
    fn subscribe(&self, class: DeviceClass) -> Result<Box<dyn HotplugStream>, DiscoveryError>;

    fn find_first(&self, class: DeviceClass) -> Result<InputDevice, DiscoveryError> {
        self.list(class)?
            .into_iter()
            .next()
            .ok_or(DiscoveryError::NotFound(class))
    }
}
