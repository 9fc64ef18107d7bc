use super::{
    Capabilities, DeviceClass, DeviceId, DeviceRegistry, DiscoveryError, HotplugEvent,
    HotplugStream, InputDevice,
};
use evdev::{AbsoluteAxisType, Key};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace};

pub struct UdevRegistry;

fn udev_err(e: std::io::Error) -> DiscoveryError {
    DiscoveryError::UdevError(e.to_string())
}

fn has_flag(device: &udev::Device, property: &str) -> bool {
    device
        .property_value(property)
        .map_or(false, |value| value == "1")
}

/// Whether a node with the given `ID_INPUT_*` flags belongs to `class`.
/// Touchpads and pointing sticks also carry the mouse flag but are not
/// mice. A node may be both a keyboard and a mouse.
fn class_matches(class: DeviceClass, flag: impl Fn(&str) -> bool) -> bool {
    match class {
        DeviceClass::Touchpad => flag("ID_INPUT_TOUCHPAD"),
        DeviceClass::Mouse => {
            flag("ID_INPUT_MOUSE")
                && !flag("ID_INPUT_TOUCHPAD")
                && !flag("ID_INPUT_POINTINGSTICK")
        }
        DeviceClass::Keyboard => flag("ID_INPUT_KEYBOARD"),
    }
}

fn device_name(device: &udev::Device) -> String {
    device
        .parent()
        .and_then(|parent| {
            parent
                .attribute_value("name")
                .map(|name| name.to_string_lossy().trim().to_string())
        })
        .unwrap_or_else(|| device.sysname().to_string_lossy().to_string())
}

/// Reads the capability bits straight from the event node. A node we may
/// not open reports no capabilities.
pub fn probe_capabilities(devnode: &Path) -> Capabilities {
    let device = match evdev::Device::open(devnode) {
        Ok(device) => device,
        Err(e) => {
            debug!("cannot probe {}: {}", devnode.display(), e);
            return Capabilities::default();
        }
    };
    let key = |k: Key| device.supported_keys().map_or(false, |keys| keys.contains(k));
    let abs = |a: AbsoluteAxisType| {
        device
            .supported_absolute_axes()
            .map_or(false, |axes| axes.contains(a))
    };

    Capabilities {
        left_button: key(Key::BTN_LEFT),
        middle_button: key(Key::BTN_MIDDLE),
        right_button: key(Key::BTN_RIGHT),
        two_finger_detection: key(Key::BTN_TOOL_DOUBLETAP),
        three_finger_detection: key(Key::BTN_TOOL_TRIPLETAP),
        pressure_detection: abs(AbsoluteAxisType::ABS_PRESSURE)
            || abs(AbsoluteAxisType::ABS_MT_PRESSURE),
        finger_width_detection: abs(AbsoluteAxisType::ABS_TOOL_WIDTH)
            || abs(AbsoluteAxisType::ABS_MT_TOUCH_MAJOR),
    }
}

/// Converts a udev device into an [`InputDevice`] if it is an event node of
/// the wanted class. Capabilities are only probed for touchpads, and only
/// when `probe` is set: removed nodes can no longer be opened.
fn to_input_device(device: &udev::Device, class: DeviceClass, probe: bool) -> Option<InputDevice> {
    if !device.sysname().to_string_lossy().starts_with("event") {
        return None;
    }
    if !class_matches(class, |property| has_flag(device, property)) {
        return None;
    }

    let devnode = device.devnode().map(PathBuf::from);
    let capabilities = match (&devnode, probe && class == DeviceClass::Touchpad) {
        (Some(node), true) => probe_capabilities(node),
        _ => Capabilities::default(),
    };

    Some(InputDevice {
        id: DeviceId::new(device.syspath().to_string_lossy()),
        name: device_name(device),
        class,
        devnode,
        capabilities,
    })
}

impl DeviceRegistry for UdevRegistry {
    fn list(&self, class: DeviceClass) -> Result<Vec<InputDevice>, DiscoveryError> {
        let mut enumerator = udev::Enumerator::new().map_err(udev_err)?;

        enumerator.match_subsystem("input").map_err(udev_err)?;

        let mut results = Vec::new();

        for device in enumerator.scan_devices().map_err(udev_err)? {
            if let Some(input) = to_input_device(&device, class, true) {
                results.push(input);
            }
        }

        Ok(results)
    }

    fn subscribe(&self, class: DeviceClass) -> Result<Box<dyn HotplugStream>, DiscoveryError> {
        let socket = udev::MonitorBuilder::new()
            .map_err(udev_err)?
            .match_subsystem("input")
            .map_err(udev_err)?
            .listen()
            .map_err(udev_err)?;

        Ok(Box::new(UdevHotplugStream { socket, class }))
    }
}

pub struct UdevHotplugStream {
    socket: udev::MonitorSocket,
    class: DeviceClass,
}

impl UdevHotplugStream {
    fn drain_one(&mut self) -> Option<HotplugEvent> {
        for event in self.socket.iter() {
            let device = event.device();
            let hotplug = match event.event_type() {
                udev::EventType::Add => {
                    to_input_device(&device, self.class, true).map(HotplugEvent::Added)
                }
                udev::EventType::Remove => {
                    to_input_device(&device, self.class, false).map(HotplugEvent::Removed)
                }
                _ => None,
            };
            if let Some(hotplug) = hotplug {
                trace!("udev {} event: {:?}", self.class, hotplug);
                return Some(hotplug);
            }
        }
        None
    }
}

impl HotplugStream for UdevHotplugStream {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<HotplugEvent>, DiscoveryError> {
        if let Some(event) = self.drain_one() {
            return Ok(Some(event));
        }

        let mut pollfd = libc::pollfd {
            fd: self.socket.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(DiscoveryError::TransportLost(err.to_string()));
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(DiscoveryError::TransportLost(
                "udev monitor socket closed".to_string(),
            ));
        }
        if ret == 0 {
            return Ok(None);
        }

        Ok(self.drain_one())
    }
}
