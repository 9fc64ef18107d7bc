//! Follows which touchpad is managed across hot-plug.

use super::{MonitorHandle, MonitorKind, StopFlag, POLL_INTERVAL};
use crate::discovery::{
    DeviceClass, DeviceRegistry, DiscoveryError, HotplugEvent, HotplugStream, InputDevice,
};
use crate::manager::{ManagerEvent, Notification};
use crossbeam_channel::Sender;
use std::sync::Arc;
use tracing::info;

pub fn spawn_touchpad_monitor(
    registry: Arc<dyn DeviceRegistry>,
    events: Sender<ManagerEvent>,
) -> MonitorHandle {
    MonitorHandle::spawn("touchpad-monitor", move |stop| {
        TouchpadMonitor {
            registry,
            events,
            present: Vec::new(),
            reported: None,
        }
        .run(&stop)
    })
}

/// Reports the first touchpad present, in plug order, whenever it changes.
struct TouchpadMonitor {
    registry: Arc<dyn DeviceRegistry>,
    events: Sender<ManagerEvent>,
    present: Vec<InputDevice>,
    reported: Option<Option<InputDevice>>,
}

impl TouchpadMonitor {
    fn run(&mut self, stop: &StopFlag) {
        let mut stream = match self.resync() {
            Ok(stream) => stream,
            Err(e) => return self.report_failure(e, true),
        };

        loop {
            match self.follow(stream.as_mut(), stop) {
                Ok(()) => return,
                Err(lost) => {
                    self.report_failure(lost, false);
                    stream = match self.resync() {
                        Ok(stream) => stream,
                        Err(e) => return self.report_failure(e, true),
                    };
                }
            }
        }
    }

    fn resync(&mut self) -> Result<Box<dyn HotplugStream>, DiscoveryError> {
        let stream = self.registry.subscribe(DeviceClass::Touchpad)?;
        self.present = self.registry.list(DeviceClass::Touchpad)?;
        self.reported = None;
        self.publish();
        Ok(stream)
    }

    fn follow(
        &mut self,
        stream: &mut dyn HotplugStream,
        stop: &StopFlag,
    ) -> Result<(), DiscoveryError> {
        while !stop.is_set() {
            match stream.next_event(POLL_INTERVAL)? {
                Some(HotplugEvent::Added(touchpad)) => {
                    info!("touchpad plugged: {}", touchpad.name);
                    self.present.retain(|t| t.id != touchpad.id);
                    self.present.push(touchpad);
                }
                Some(HotplugEvent::Removed(touchpad)) => {
                    info!("touchpad removed: {}", touchpad.name);
                    self.present.retain(|t| t.id != touchpad.id);
                }
                None => continue,
            }
            self.publish();
        }
        Ok(())
    }

    fn publish(&mut self) {
        let first = self.present.first().cloned();
        if self.reported.as_ref() == Some(&first) {
            return;
        }
        self.reported = Some(first.clone());
        let _ = self.events.send(ManagerEvent::Touchpad(first));
    }

    fn report_failure(&self, error: DiscoveryError, persistent: bool) {
        let _ = self
            .events
            .send(ManagerEvent::Report(Notification::MonitorFailed {
                monitor: MonitorKind::Touchpad,
                error: error.to_string(),
                persistent,
            }));
    }
}
