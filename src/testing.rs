//! In-memory stand-ins for the device layer.

use crate::discovery::{
    Capabilities, DeviceClass, DeviceId, DeviceRegistry, DiscoveryError, HotplugEvent,
    HotplugStream, InputDevice,
};
use crate::keys::KeyFilter;
use crate::manager::{ManagerEvent, Notification, Observer};
use crate::monitor::keyboard::{KeyboardAttach, KeyboardBackend};
use crate::monitor::{MonitorError, MonitorHandle};
use crate::property::{check_write, Property, PropertyError, PropertyStore, PropertyValue};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(2);

fn device(sysname: &str, name: &str, class: DeviceClass) -> InputDevice {
    InputDevice {
        id: DeviceId::new(format!("/sys/devices/virtual/input/{}", sysname)),
        name: name.to_string(),
        class,
        devnode: Some(format!("/dev/input/{}", sysname).into()),
        capabilities: Capabilities::default(),
    }
}

pub fn mouse(sysname: &str, name: &str) -> InputDevice {
    device(sysname, name, DeviceClass::Mouse)
}

pub fn keyboard(sysname: &str, name: &str) -> InputDevice {
    device(sysname, name, DeviceClass::Keyboard)
}

pub fn touchpad(sysname: &str, name: &str) -> InputDevice {
    device(sysname, name, DeviceClass::Touchpad)
}

/// Polls `check` until it holds or the wait runs out.
fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    check()
}

enum StreamMsg {
    Event(HotplugEvent),
    Break,
}

struct Subscriber {
    class: DeviceClass,
    tx: Sender<StreamMsg>,
    alive: Weak<()>,
}

#[derive(Default)]
struct RegistryState {
    devices: Vec<InputDevice>,
    subscribers: Vec<Subscriber>,
    refuse: bool,
}

/// Device registry whose devices are plugged and unplugged by the test.
#[derive(Default)]
pub struct FakeRegistry {
    state: Mutex<RegistryState>,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plug(&self, device: InputDevice) {
        let mut state = self.state.lock().unwrap();
        state.devices.push(device.clone());
        broadcast(&mut state, HotplugEvent::Added(device));
    }

    /// Removes the device whose syspath ends in `sysname`.
    pub fn unplug(&self, sysname: &str) {
        let suffix = format!("/{}", sysname);
        let mut state = self.state.lock().unwrap();
        let Some(index) = state
            .devices
            .iter()
            .position(|d| d.id.as_str().ends_with(&suffix))
        else {
            return;
        };
        let device = state.devices.remove(index);
        broadcast(&mut state, HotplugEvent::Removed(device));
    }

    /// Waits until exactly `count` streams are open.
    pub fn wait_for_subscribers(&self, count: usize) {
        let ok = wait_until(|| {
            let mut state = self.state.lock().unwrap();
            state.subscribers.retain(|s| s.alive.strong_count() > 0);
            state.subscribers.len() == count
        });
        assert!(ok, "expected {} subscribers", count);
    }

    /// Kills every open stream.
    pub fn break_streams(&self) {
        let mut state = self.state.lock().unwrap();
        for subscriber in state.subscribers.drain(..) {
            let _ = subscriber.tx.send(StreamMsg::Break);
        }
    }

    pub fn refuse_subscriptions(&self, refuse: bool) {
        self.state.lock().unwrap().refuse = refuse;
    }
}

fn broadcast(state: &mut RegistryState, event: HotplugEvent) {
    let class = match &event {
        HotplugEvent::Added(d) | HotplugEvent::Removed(d) => d.class,
    };
    state
        .subscribers
        .retain(|s| s.class != class || s.tx.send(StreamMsg::Event(event.clone())).is_ok());
}

impl DeviceRegistry for FakeRegistry {
    fn list(&self, class: DeviceClass) -> Result<Vec<InputDevice>, DiscoveryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .devices
            .iter()
            .filter(|d| d.class == class)
            .cloned()
            .collect())
    }

    fn subscribe(&self, class: DeviceClass) -> Result<Box<dyn HotplugStream>, DiscoveryError> {
        let mut state = self.state.lock().unwrap();
        if state.refuse {
            return Err(DiscoveryError::UdevError("subscriptions refused".to_string()));
        }
        let (tx, rx) = unbounded();
        let alive = Arc::new(());
        state.subscribers.push(Subscriber {
            class,
            tx,
            alive: Arc::downgrade(&alive),
        });
        Ok(Box::new(FakeStream { rx, _alive: alive }))
    }
}

struct FakeStream {
    rx: Receiver<StreamMsg>,
    _alive: Arc<()>,
}

impl HotplugStream for FakeStream {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<HotplugEvent>, DiscoveryError> {
        match self.rx.recv_timeout(timeout) {
            Ok(StreamMsg::Event(event)) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Ok(StreamMsg::Break) | Err(RecvTimeoutError::Disconnected) => {
                Err(DiscoveryError::TransportLost("fake stream broken".to_string()))
            }
        }
    }
}

#[derive(Default)]
struct PadState {
    off: bool,
    writes: Vec<bool>,
    fail: bool,
}

/// Touchpad that records every write to `touchpad_off`.
#[derive(Clone, Default)]
pub struct FakeTouchpad {
    state: Arc<Mutex<PadState>>,
}

impl FakeTouchpad {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> Vec<bool> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail = fail;
    }

    /// Flips the device the way a user or another program would.
    pub fn toggle_out_of_band(&self, off: bool) {
        self.state.lock().unwrap().off = off;
    }

    pub fn is_off(&self) -> bool {
        self.state.lock().unwrap().off
    }

    pub fn wait_for(&self, off: bool) -> bool {
        wait_until(|| self.is_off() == off)
    }
}

impl PropertyStore for FakeTouchpad {
    fn get(&self, property: Property) -> Result<PropertyValue, PropertyError> {
        match property {
            Property::TouchpadOff => Ok(PropertyValue::Bool(self.is_off())),
            other => other
                .from_capabilities(&Capabilities::default())
                .ok_or_else(|| PropertyError::Unsupported(other.name().to_string())),
        }
    }

    fn set(&mut self, property: Property, value: PropertyValue) -> Result<(), PropertyError> {
        check_write(property, &value)?;
        let mut state = self.state.lock().unwrap();
        if state.fail {
            return Err(PropertyError::Unsupported(property.name().to_string()));
        }
        if let PropertyValue::Bool(off) = value {
            state.off = off;
            state.writes.push(off);
        }
        Ok(())
    }
}

/// Observer that keeps every notification.
#[derive(Clone, Default)]
pub struct RecordingObserver {
    seen: Arc<Mutex<Vec<Notification>>>,
}

impl RecordingObserver {
    pub fn wait_for(&self, matches: impl Fn(&Notification) -> bool) -> bool {
        wait_until(|| self.seen.lock().unwrap().iter().any(&matches))
    }
}

impl Observer for RecordingObserver {
    fn notify(&self, notification: &Notification) {
        self.seen.lock().unwrap().push(notification.clone());
    }
}

/// Keyboard readers that never produce keys.
struct IdleAttach;

impl KeyboardAttach for IdleAttach {
    fn attach(
        &self,
        _keyboard: &InputDevice,
        _filter: KeyFilter,
        _events: Sender<ManagerEvent>,
    ) -> Result<MonitorHandle, MonitorError> {
        Ok(MonitorHandle::spawn("idle-reader", |stop| {
            while !stop.is_set() {
                thread::sleep(Duration::from_millis(5));
            }
        }))
    }
}

pub fn idle_keyboards() -> KeyboardBackend {
    KeyboardBackend {
        seat_tap: None,
        attach: Arc::new(IdleAttach),
    }
}
