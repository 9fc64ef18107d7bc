//! systemd-logind sleep notifications.

use crate::manager::runner::ManagerHandle;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};
use zbus::blocking::Connection;
use zbus::proxy;

#[proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
trait LoginManager {
    /// Sent with `true` before the system sleeps and `false` after it wakes.
    #[zbus(signal)]
    fn prepare_for_sleep(&self, start: bool) -> zbus::Result<()>;
}

/// Forwards logind's sleep notifications to the manager. Fails when the
/// system bus is unreachable.
pub fn spawn_suspend_watcher(manager: ManagerHandle) -> anyhow::Result<JoinHandle<()>> {
    let connection = Connection::system()?;
    let handle = thread::Builder::new()
        .name("suspend-watcher".to_string())
        .spawn(move || {
            if let Err(e) = watch(&connection, &manager) {
                warn!("suspend watcher stopped: {}", e);
            }
        })?;
    Ok(handle)
}

fn watch(connection: &Connection, manager: &ManagerHandle) -> zbus::Result<()> {
    let proxy = LoginManagerProxyBlocking::new(connection)?;
    let signals = proxy.receive_prepare_for_sleep()?;
    debug!("listening for logind PrepareForSleep");

    for signal in signals {
        let args = signal.args()?;
        if *args.start() {
            info!("system is going to sleep");
            manager.suspend();
        } else {
            info!("system woke up");
            manager.resume();
        }
    }
    Ok(())
}
