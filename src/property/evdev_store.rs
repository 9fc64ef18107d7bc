use super::{check_write, Property, PropertyError, PropertyStore, PropertyValue};
use crate::discovery::{Capabilities, InputDevice};
use evdev::Device;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Touchpad backed by its evdev node. Switching the touchpad off takes an
/// exclusive grab on the node, so no other input client sees its events
/// until the grab is released.
pub struct EvdevTouchpad {
    device: RefCell<Device>,
    path: PathBuf,
    capabilities: Capabilities,
    grabbed: bool,
}

impl EvdevTouchpad {
    pub fn open(touchpad: &InputDevice) -> Result<Self, PropertyError> {
        let path = touchpad.devnode.as_deref().ok_or_else(|| {
            PropertyError::Transport(format!("{} has no device node", touchpad.name))
        })?;
        Self::open_path(path, touchpad.capabilities)
    }

    pub fn open_path(path: &Path, capabilities: Capabilities) -> Result<Self, PropertyError> {
        let device = Device::open(path)
            .map_err(|e| PropertyError::Transport(format!("{}: {}", path.display(), e)))?;

        Ok(Self {
            device: RefCell::new(device),
            path: path.to_path_buf(),
            capabilities,
            grabbed: false,
        })
    }

    /// Whether some other client holds the exclusive grab. Probed by taking
    /// the grab and releasing it straight away; the kernel answers EBUSY
    /// while another client has it.
    fn grabbed_elsewhere(&self) -> Result<bool, PropertyError> {
        let mut device = self.device.borrow_mut();
        match device.grab() {
            Ok(()) => {
                device
                    .ungrab()
                    .map_err(|e| PropertyError::Transport(format!("ungrab failed: {}", e)))?;
                Ok(false)
            }
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                debug!("{} is grabbed by another client", self.path.display());
                Ok(true)
            }
            Err(e) => Err(PropertyError::Transport(format!("grab probe failed: {}", e))),
        }
    }
}

impl PropertyStore for EvdevTouchpad {
    fn get(&self, property: Property) -> Result<PropertyValue, PropertyError> {
        match property {
            Property::TouchpadOff if self.grabbed => Ok(PropertyValue::Bool(true)),
            Property::TouchpadOff => self.grabbed_elsewhere().map(PropertyValue::Bool),
            other => other
                .from_capabilities(&self.capabilities)
                .ok_or_else(|| PropertyError::Unsupported(other.name().to_string())),
        }
    }

    fn set(&mut self, property: Property, value: PropertyValue) -> Result<(), PropertyError> {
        check_write(property, &value)?;
        let PropertyValue::Bool(off) = value else {
            return Err(PropertyError::Unsupported(property.name().to_string()));
        };

        let device = self.device.get_mut();
        if off {
            device
                .grab()
                .map_err(|e| PropertyError::Transport(format!("grab failed: {}", e)))?;
        } else {
            device
                .ungrab()
                .map_err(|e| PropertyError::Transport(format!("ungrab failed: {}", e)))?;
        }
        self.grabbed = off;
        info!(
            "touchpad {} switched {}",
            self.path.display(),
            if off { "off" } else { "on" }
        );
        Ok(())
    }
}
