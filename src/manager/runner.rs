//! The manager's control thread.
//!
//! All signals funnel into one unbounded queue drained here, so transitions
//! never interleave. Device writes go to a separate switch thread and their
//! failures come back through the same queue.

use super::state::{Signal, SwitchCommand, TouchpadManager};
use super::{ManagerEvent, Notification, Observer};
use crate::config::ManagementConfig;
use crate::discovery::{DeviceClass, DeviceId, DeviceRegistry, DiscoveryError, InputDevice};
use crate::monitor::keyboard::{spawn_keyboard_monitor, KeyboardBackend};
use crate::monitor::mouse::{mouse_present, spawn_mouse_monitor};
use crate::monitor::touchpad::spawn_touchpad_monitor;
use crate::monitor::MonitorHandle;
use crate::property::{PropertyError, PropertyStore, TouchpadSwitch};
use crossbeam_channel::{select, unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Cloneable entry point for the process supervisor, signal handlers and
/// configuration reloads.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: Sender<ManagerEvent>,
}

impl ManagerHandle {
    pub fn reconfigure(&self, config: ManagementConfig) {
        let _ = self.tx.send(ManagerEvent::ConfigChanged(config));
    }

    pub fn suspend(&self) {
        let _ = self.tx.send(ManagerEvent::Suspend);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(ManagerEvent::Resume);
    }

    pub fn report(&self, notification: Notification) {
        let _ = self.tx.send(ManagerEvent::Report(notification));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ManagerEvent::Shutdown);
    }

    #[cfg(test)]
    pub fn send(&self, event: ManagerEvent) {
        let _ = self.tx.send(event);
    }

    /// A handle with no runner behind it; events land in the receiver.
    #[cfg(test)]
    pub fn detached() -> (Self, Receiver<ManagerEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

/// Opens the property store of a discovered touchpad.
pub type TouchpadOpener =
    Box<dyn Fn(&InputDevice) -> Result<Box<dyn PropertyStore>, PropertyError> + Send>;

/// Owns the touchpad store on its own thread so device round trips never
/// hold up the queue. Queued commands collapse to the newest one.
struct SwitchThread {
    tx: Option<Sender<SwitchCommand>>,
    thread: Option<JoinHandle<()>>,
}

impl SwitchThread {
    fn spawn(store: Box<dyn PropertyStore>, events: Sender<ManagerEvent>) -> Self {
        let (tx, rx) = unbounded::<SwitchCommand>();
        let thread = thread::Builder::new()
            .name("touchpad-switch".to_string())
            .spawn(move || {
                let mut switch = TouchpadSwitch::new(store);
                while let Ok(command) = rx.recv() {
                    let command = rx.try_iter().last().unwrap_or(command);
                    match switch.apply(command.off) {
                        Ok(true) => {
                            let _ = events.send(ManagerEvent::Report(Notification::Switched {
                                off: command.off,
                            }));
                        }
                        Ok(false) => {}
                        Err(error) => {
                            let _ = events.send(ManagerEvent::SwitchFailed {
                                off: command.off,
                                error,
                            });
                        }
                    }
                }
            });

        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("failed to spawn touchpad switch thread: {}", e);
                None
            }
        };

        Self {
            tx: Some(tx),
            thread,
        }
    }

    fn send(&self, command: SwitchCommand) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(command);
        }
    }

    /// Waits until every queued command has been applied.
    fn finish(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// The touchpad currently under management. `switch` is `None` when the
/// device was found but could not be opened.
struct ManagedTouchpad {
    id: DeviceId,
    switch: Option<SwitchThread>,
}

pub struct Runner {
    machine: TouchpadManager,
    registry: Arc<dyn DeviceRegistry>,
    keyboard_backend: KeyboardBackend,
    open_touchpad: TouchpadOpener,
    observer: Box<dyn Observer>,
    tx: Sender<ManagerEvent>,
    rx: Receiver<ManagerEvent>,
    touchpad: Option<ManagedTouchpad>,
    mouse_monitor: Option<MonitorHandle>,
    keyboard_monitor: Option<MonitorHandle>,
    touchpad_monitor: Option<MonitorHandle>,
    suspended: bool,
}

impl Runner {
    pub fn new(
        config: ManagementConfig,
        registry: Arc<dyn DeviceRegistry>,
        keyboard_backend: KeyboardBackend,
        open_touchpad: TouchpadOpener,
        observer: Box<dyn Observer>,
    ) -> Self {
        let (tx, rx) = unbounded();
        Self {
            machine: TouchpadManager::new(config),
            registry,
            keyboard_backend,
            open_touchpad,
            observer,
            tx,
            rx,
            touchpad: None,
            mouse_monitor: None,
            keyboard_monitor: None,
            touchpad_monitor: None,
            suspended: false,
        }
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Runs until a shutdown request, then leaves the touchpad on.
    pub fn run(mut self) {
        let first = self.first_touchpad();
        self.adopt_touchpad(first);
        let present = self.mouse_present_now();
        let command = self.machine.start(present);
        self.dispatch(Some(command));
        self.start_monitors();
        info!("touchpad management started");

        let events = self.rx.clone();
        loop {
            let (generation, timer) = match self.machine.pending_timer() {
                Some((generation, deadline)) => (generation, crossbeam_channel::at(deadline)),
                None => (0, crossbeam_channel::never()),
            };

            select! {
                recv(events) -> event => match event {
                    Ok(ManagerEvent::Shutdown) | Err(_) => break,
                    Ok(event) => self.on_event(event),
                },
                recv(timer) -> _ => {
                    let command = self
                        .machine
                        .handle(Signal::IdleExpired { generation }, Instant::now());
                    self.dispatch(command);
                }
            }
        }

        self.shutdown();
    }

    fn on_event(&mut self, event: ManagerEvent) {
        let now = Instant::now();
        match event {
            ManagerEvent::KeyActivity(at) => {
                let command = self.machine.handle(Signal::KeyActivity(at), now);
                self.dispatch(command);
            }
            ManagerEvent::MousePresence(present) => {
                let command = self.machine.handle(Signal::MousePresence(present), now);
                self.dispatch(command);
            }
            ManagerEvent::Touchpad(first) => self.touchpad_changed(first),
            ManagerEvent::ConfigChanged(config) => self.reconfigure(config, now),
            ManagerEvent::Suspend => {
                if self.suspended {
                    return;
                }
                info!("system suspending, pausing monitors");
                self.suspended = true;
                self.stop_monitors();
                self.machine.suspend();
            }
            ManagerEvent::Resume => {
                info!("system resumed, rebuilding monitors");
                self.suspended = false;
                self.stop_monitors();
                // Device nodes may have been recreated while asleep.
                self.release_touchpad();
                let first = self.first_touchpad();
                self.adopt_touchpad(first);
                let present = self.mouse_present_now();
                let command = self.machine.resume(present);
                self.dispatch(Some(command));
                self.start_monitors();
            }
            ManagerEvent::SwitchFailed { off, error } => {
                self.observer.notify(&Notification::SwitchFailed {
                    off,
                    error: error.to_string(),
                });
                self.machine.handle(Signal::SwitchFailed { off }, now);
            }
            ManagerEvent::Report(notification) => self.observer.notify(&notification),
            ManagerEvent::Shutdown => {}
        }
    }

    fn touchpad_changed(&mut self, first: Option<InputDevice>) {
        if self.suspended {
            return;
        }
        let current = self.touchpad.as_ref().map(|t| &t.id);
        if current == first.as_ref().map(|t| &t.id) {
            return;
        }
        self.release_touchpad();
        if self.adopt_touchpad(first) {
            let present = self.mouse_present_now();
            let command = self.machine.start(present);
            self.dispatch(Some(command));
        }
    }

    fn first_touchpad(&self) -> Option<InputDevice> {
        match self.registry.find_first(DeviceClass::Touchpad) {
            Ok(touchpad) => Some(touchpad),
            Err(DiscoveryError::NotFound(_)) => None,
            Err(e) => {
                warn!("cannot enumerate touchpads: {}", e);
                None
            }
        }
    }

    /// Opens `touchpad` and starts its switch thread. Returns whether the
    /// touchpad can now be written.
    fn adopt_touchpad(&mut self, touchpad: Option<InputDevice>) -> bool {
        let Some(touchpad) = touchpad else {
            self.observer
                .notify(&Notification::DeviceNotFound(DeviceClass::Touchpad));
            return false;
        };
        let switch = match (self.open_touchpad)(&touchpad) {
            Ok(store) => {
                info!("managing touchpad {} ({})", touchpad.name, touchpad.id);
                Some(SwitchThread::spawn(store, self.tx.clone()))
            }
            Err(error) => {
                self.observer.notify(&Notification::TouchpadUnusable {
                    name: touchpad.name.clone(),
                    error: error.to_string(),
                });
                None
            }
        };
        let writable = switch.is_some();
        self.touchpad = Some(ManagedTouchpad {
            id: touchpad.id,
            switch,
        });
        writable
    }

    /// Applies every queued write, then closes the store.
    fn release_touchpad(&mut self) {
        if let Some(mut switch) = self.touchpad.take().and_then(|t| t.switch) {
            switch.finish();
        }
    }

    fn reconfigure(&mut self, config: ManagementConfig, now: Instant) {
        let old = self.machine.config().clone();
        if old == config {
            debug!("configuration unchanged");
            return;
        }
        info!("applying new configuration");

        let command = self.machine.reconfigure(config.clone(), now);
        self.dispatch(command);
        if self.suspended {
            return;
        }

        if old.monitor_mouse != config.monitor_mouse
            || old.ignored_mouse_devices != config.ignored_mouse_devices
        {
            if let Some(monitor) = self.mouse_monitor.take() {
                monitor.stop();
            }
            self.start_mouse_monitor();
        }
        if old.monitor_keyboard != config.monitor_keyboard
            || old.key_ignore_policy != config.key_ignore_policy
        {
            if let Some(monitor) = self.keyboard_monitor.take() {
                monitor.stop();
            }
            self.start_keyboard_monitor();
        }
    }

    fn dispatch(&self, command: Option<SwitchCommand>) {
        let switch = self.touchpad.as_ref().and_then(|t| t.switch.as_ref());
        match (command, switch) {
            (Some(command), Some(switch)) => switch.send(command),
            (Some(command), None) => debug!("no touchpad to apply {:?}", command),
            (None, _) => {}
        }
    }

    fn mouse_present_now(&self) -> bool {
        let config = self.machine.config();
        if !config.monitor_mouse {
            return false;
        }
        match mouse_present(self.registry.as_ref(), &config.ignored_mouse_devices) {
            Ok(present) => present,
            Err(e) => {
                warn!("cannot enumerate mice: {}", e);
                false
            }
        }
    }

    fn start_monitors(&mut self) {
        self.touchpad_monitor = Some(spawn_touchpad_monitor(
            self.registry.clone(),
            self.tx.clone(),
        ));
        self.start_mouse_monitor();
        self.start_keyboard_monitor();
    }

    fn start_mouse_monitor(&mut self) {
        let config = self.machine.config();
        if config.monitor_mouse {
            self.mouse_monitor = Some(spawn_mouse_monitor(
                self.registry.clone(),
                config.ignored_mouse_devices.clone(),
                self.tx.clone(),
            ));
        }
    }

    fn start_keyboard_monitor(&mut self) {
        let config = self.machine.config();
        if config.monitor_keyboard {
            self.keyboard_monitor = Some(spawn_keyboard_monitor(
                self.registry.clone(),
                config.key_ignore_policy,
                self.keyboard_backend.clone(),
                self.tx.clone(),
            ));
        }
    }

    fn stop_monitors(&mut self) {
        for monitor in [
            self.touchpad_monitor.take(),
            self.mouse_monitor.take(),
            self.keyboard_monitor.take(),
        ]
        .into_iter()
        .flatten()
        {
            monitor.stop();
        }
    }

    fn shutdown(&mut self) {
        info!("stopping touchpad management");
        self.stop_monitors();
        let command = self.machine.shutdown();
        self.dispatch(Some(command));
        self.release_touchpad();

        for event in self.rx.try_iter() {
            match event {
                ManagerEvent::Report(notification) => self.observer.notify(&notification),
                ManagerEvent::SwitchFailed { off, error } => {
                    self.observer.notify(&Notification::SwitchFailed {
                        off,
                        error: error.to_string(),
                    })
                }
                _ => {}
            }
        }
    }
}
