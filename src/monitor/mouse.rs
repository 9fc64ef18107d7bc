//! Mouse presence monitoring.

use super::{MonitorHandle, MonitorKind, StopFlag, POLL_INTERVAL};
use crate::config::IgnoredDeviceSet;
use crate::discovery::{
    DeviceClass, DeviceId, DeviceRegistry, DiscoveryError, HotplugEvent, HotplugStream,
};
use crate::manager::{ManagerEvent, Notification};
use crossbeam_channel::Sender;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Whether any mouse outside `ignored` is plugged in right now.
pub fn mouse_present(
    registry: &dyn DeviceRegistry,
    ignored: &IgnoredDeviceSet,
) -> Result<bool, DiscoveryError> {
    Ok(registry
        .list(DeviceClass::Mouse)?
        .iter()
        .any(|mouse| !ignored.contains(mouse)))
}

pub fn spawn_mouse_monitor(
    registry: Arc<dyn DeviceRegistry>,
    ignored: IgnoredDeviceSet,
    events: Sender<ManagerEvent>,
) -> MonitorHandle {
    MonitorHandle::spawn("mouse-monitor", move |stop| {
        MouseMonitor::new(registry, ignored, events).run(&stop)
    })
}

/// Follows mouse hot-plug and reports presence changes. Presence is derived
/// from the full set of non-ignored mice, never toggled per event.
struct MouseMonitor {
    registry: Arc<dyn DeviceRegistry>,
    ignored: IgnoredDeviceSet,
    events: Sender<ManagerEvent>,
    present: BTreeSet<DeviceId>,
    reported: Option<bool>,
}

impl MouseMonitor {
    fn new(
        registry: Arc<dyn DeviceRegistry>,
        ignored: IgnoredDeviceSet,
        events: Sender<ManagerEvent>,
    ) -> Self {
        Self {
            registry,
            ignored,
            events,
            present: BTreeSet::new(),
            reported: None,
        }
    }

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

    /// Subscribes first, then takes the snapshot, so no plug event falls
    /// between the two.
    fn resync(&mut self) -> Result<Box<dyn HotplugStream>, DiscoveryError> {
        let stream = self.registry.subscribe(DeviceClass::Mouse)?;
        self.present = self
            .registry
            .list(DeviceClass::Mouse)?
            .into_iter()
            .filter(|mouse| !self.ignored.contains(mouse))
            .map(|mouse| mouse.id)
            .collect();
        // A resync after a lost stream must re-announce presence.
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
                Some(HotplugEvent::Added(mouse)) => {
                    if self.ignored.contains(&mouse) {
                        debug!("ignoring mouse {}", mouse.name);
                        continue;
                    }
                    info!("mouse plugged: {}", mouse.name);
                    self.present.insert(mouse.id);
                }
                Some(HotplugEvent::Removed(mouse)) => {
                    if self.present.remove(&mouse.id) {
                        info!("mouse unplugged: {}", mouse.name);
                    }
                }
                None => continue,
            }
            self.publish();
        }
        Ok(())
    }

    fn publish(&mut self) {
        let present = !self.present.is_empty();
        if self.reported == Some(present) {
            return;
        }
        debug!("{} mice present", self.present.len());
        self.reported = Some(present);
        let _ = self.events.send(ManagerEvent::MousePresence(present));
    }

    fn report_failure(&self, error: DiscoveryError, persistent: bool) {
        let _ = self
            .events
            .send(ManagerEvent::Report(Notification::MonitorFailed {
                monitor: MonitorKind::Mouse,
                error: error.to_string(),
                persistent,
            }));
    }
}
