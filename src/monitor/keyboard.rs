//! Typing detection.
//!
//! A seat-wide key tap sees every keyboard at once and follows hot-plug by
//! itself, so it is preferred. Without one, each keyboard gets its own
//! reader thread and new keyboards are attached as the registry reports
//! them.

use super::{MonitorError, MonitorHandle, MonitorKind, StopFlag, POLL_INTERVAL};
use crate::discovery::{DeviceClass, DeviceId, DeviceRegistry, HotplugEvent, InputDevice};
use crate::keys::{KeyFilter, KeyIgnorePolicy};
use crate::manager::{ManagerEvent, Notification};
use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Key events from every keyboard of a seat.
pub trait SeatTap {
    /// Feeds key events through `filter` until `stop` is set. An error means
    /// the tap's event source is gone.
    fn run(
        &mut self,
        filter: &mut KeyFilter,
        events: &Sender<ManagerEvent>,
        stop: &StopFlag,
    ) -> Result<(), MonitorError>;
}

pub type SeatTapOpener = Arc<dyn Fn() -> Result<Box<dyn SeatTap>, MonitorError> + Send + Sync>;

/// Starts a reader thread for a single keyboard.
pub trait KeyboardAttach: Send + Sync {
    fn attach(
        &self,
        keyboard: &InputDevice,
        filter: KeyFilter,
        events: Sender<ManagerEvent>,
    ) -> Result<MonitorHandle, MonitorError>;
}

#[derive(Clone)]
pub struct KeyboardBackend {
    pub seat_tap: Option<SeatTapOpener>,
    pub attach: Arc<dyn KeyboardAttach>,
}

#[cfg(target_os = "linux")]
impl KeyboardBackend {
    pub fn linux(use_seat_tap: bool) -> Self {
        let seat_tap: Option<SeatTapOpener> = if use_seat_tap {
            Some(Arc::new(|| -> Result<Box<dyn SeatTap>, MonitorError> {
                super::libinput_tap::LibinputTap::open("seat0")
                    .map(|tap| Box::new(tap) as Box<dyn SeatTap>)
            }))
        } else {
            None
        };
        Self {
            seat_tap,
            attach: Arc::new(evdev_reader::EvdevAttach),
        }
    }
}

/// Forwards a key event, returning false once the manager has gone away.
pub fn forward_key(
    filter: &mut KeyFilter,
    events: &Sender<ManagerEvent>,
    code: u16,
    pressed: bool,
) -> bool {
    if filter.key(code, pressed) {
        return events.send(ManagerEvent::KeyActivity(Instant::now())).is_ok();
    }
    true
}

/// Maps an `EV_KEY` value to a press or release. Autorepeat (2) is
/// dropped, as the seat-wide tap never reports it.
fn key_transition(value: i32) -> Option<bool> {
    match value {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

pub fn spawn_keyboard_monitor(
    registry: Arc<dyn DeviceRegistry>,
    policy: KeyIgnorePolicy,
    backend: KeyboardBackend,
    events: Sender<ManagerEvent>,
) -> MonitorHandle {
    MonitorHandle::spawn("keyboard-monitor", move |stop| {
        let monitor = KeyboardMonitor {
            registry,
            policy,
            backend,
            events,
        };
        monitor.run(&stop)
    })
}

struct KeyboardMonitor {
    registry: Arc<dyn DeviceRegistry>,
    policy: KeyIgnorePolicy,
    backend: KeyboardBackend,
    events: Sender<ManagerEvent>,
}

impl KeyboardMonitor {
    fn run(&self, stop: &StopFlag) {
        if let Some(open) = &self.backend.seat_tap {
            match self.run_seat_tap(open, stop) {
                Ok(()) => return,
                Err(e) => info!(
                    "seat-wide key tap unavailable ({}), attaching to keyboards individually",
                    e
                ),
            }
        }
        self.run_per_device(stop);
    }

    /// A lost tap gets one reopen before the per-device fallback takes over.
    fn run_seat_tap(&self, open: &SeatTapOpener, stop: &StopFlag) -> Result<(), MonitorError> {
        let mut filter = KeyFilter::new(self.policy);
        let mut tap = open()?;
        info!("watching keyboards through the seat-wide key tap");
        match tap.run(&mut filter, &self.events, stop) {
            Ok(()) => Ok(()),
            Err(lost) => {
                self.report(lost.to_string(), false);
                filter.reset();
                let mut tap = open()?;
                tap.run(&mut filter, &self.events, stop)
            }
        }
    }

    fn run_per_device(&self, stop: &StopFlag) {
        let mut readers: HashMap<DeviceId, MonitorHandle> = HashMap::new();

        let mut stream = match self.registry.subscribe(DeviceClass::Keyboard) {
            Ok(stream) => stream,
            Err(e) => return self.report(e.to_string(), true),
        };
        self.attach_present(&mut readers, true);

        while !stop.is_set() {
            // Readers exit on their own when their device disappears.
            readers.retain(|_, reader| reader.is_running());

            match stream.next_event(POLL_INTERVAL) {
                Ok(Some(HotplugEvent::Added(keyboard))) => {
                    self.attach(&mut readers, &keyboard)
                }
                Ok(Some(HotplugEvent::Removed(keyboard))) => {
                    if let Some(reader) = readers.remove(&keyboard.id) {
                        debug!("keyboard removed: {}", keyboard.name);
                        reader.stop();
                    }
                }
                Ok(None) => {}
                Err(lost) => {
                    self.report(lost.to_string(), false);
                    match self.registry.subscribe(DeviceClass::Keyboard) {
                        Ok(fresh) => {
                            stream = fresh;
                            self.attach_present(&mut readers, false);
                        }
                        Err(e) => {
                            self.report(e.to_string(), true);
                            break;
                        }
                    }
                }
            }
        }

        for (_, reader) in readers.drain() {
            reader.stop();
        }
    }

    fn attach_present(&self, readers: &mut HashMap<DeviceId, MonitorHandle>, startup: bool) {
        match self.registry.list(DeviceClass::Keyboard) {
            Ok(keyboards) => {
                if keyboards.is_empty() && startup {
                    let _ = self.events.send(ManagerEvent::Report(
                        Notification::DeviceNotFound(DeviceClass::Keyboard),
                    ));
                }
                for keyboard in &keyboards {
                    self.attach(readers, keyboard);
                }
            }
            Err(e) => self.report(e.to_string(), false),
        }
    }

    fn attach(&self, readers: &mut HashMap<DeviceId, MonitorHandle>, keyboard: &InputDevice) {
        if readers.contains_key(&keyboard.id) {
            return;
        }
        match self.backend.attach.attach(
            keyboard,
            KeyFilter::new(self.policy),
            self.events.clone(),
        ) {
            Ok(reader) => {
                info!("watching keyboard: {}", keyboard.name);
                readers.insert(keyboard.id.clone(), reader);
            }
            Err(e) => warn!("cannot watch keyboard {}: {}", keyboard.name, e),
        }
    }

    fn report(&self, error: String, persistent: bool) {
        let _ = self
            .events
            .send(ManagerEvent::Report(Notification::MonitorFailed {
                monitor: MonitorKind::Keyboard,
                error,
                persistent,
            }));
    }
}

#[cfg(target_os = "linux")]
pub mod evdev_reader {
    use super::{forward_key, key_transition, KeyboardAttach};
    use crate::discovery::InputDevice;
    use crate::keys::KeyFilter;
    use crate::manager::ManagerEvent;
    use crate::monitor::{MonitorError, MonitorHandle, StopFlag, POLL_INTERVAL};
    use crossbeam_channel::Sender;
    use evdev::{Device, EventType};
    use std::os::unix::io::AsRawFd;
    use tracing::debug;

    pub struct EvdevAttach;

    impl KeyboardAttach for EvdevAttach {
        fn attach(
            &self,
            keyboard: &InputDevice,
            filter: KeyFilter,
            events: Sender<ManagerEvent>,
        ) -> Result<MonitorHandle, MonitorError> {
            let path = keyboard
                .devnode
                .clone()
                .ok_or_else(|| MonitorError::OpenFailed {
                    path: keyboard.id.to_string(),
                    reason: "no device node".to_string(),
                })?;
            let device = Device::open(&path).map_err(|e| MonitorError::OpenFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            let name = format!("kbd-{}", keyboard.name);
            Ok(MonitorHandle::spawn(name, move |stop| {
                if let Err(e) = read_keys(device, filter, &events, &stop) {
                    debug!("keyboard {} dropped: {}", path.display(), e);
                }
            }))
        }
    }

    fn read_keys(
        mut device: Device,
        mut filter: KeyFilter,
        events: &Sender<ManagerEvent>,
        stop: &StopFlag,
    ) -> Result<(), MonitorError> {
        let mut pollfd = libc::pollfd {
            fd: device.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = POLL_INTERVAL.as_millis() as i32;

        while !stop.is_set() {
            let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(MonitorError::ReadError(err.to_string()));
            }
            if ret == 0 {
                continue;
            }
            if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                return Err(MonitorError::ReadError("device gone".to_string()));
            }

            let keys: Vec<(u16, bool)> = match device.fetch_events() {
                Ok(batch) => batch
                    .filter(|event| event.event_type() == EventType::KEY)
                    .filter_map(|event| Some((event.code(), key_transition(event.value())?)))
                    .collect(),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(MonitorError::ReadError(e.to_string())),
            };
            for (code, pressed) in keys {
                if !forward_key(&mut filter, events, code, pressed) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}
