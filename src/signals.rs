//! Process signals: SIGHUP reloads the configuration, SIGINT and SIGTERM
//! shut the manager down.

use crate::config::{ConfigError, ManagementConfig};
use crate::manager::runner::ManagerHandle;
use crate::manager::Notification;
use nix::sys::signal::{SigSet, Signal};
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// Blocks the handled signals on the calling thread. Must run before any
/// other thread is spawned so every thread inherits the mask and only the
/// signal thread ever receives them.
pub fn block_signals() -> nix::Result<SigSet> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGHUP);
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.thread_block()?;
    Ok(set)
}

/// A configuration that fails to load leaves the current one in place.
fn reload_config<F>(manager: &ManagerHandle, reload: &F)
where
    F: Fn() -> Result<ManagementConfig, ConfigError>,
{
    match reload() {
        Ok(config) => manager.reconfigure(config),
        Err(e) => manager.report(Notification::ConfigRejected(e.to_string())),
    }
}

pub fn spawn_signal_thread<F>(
    set: SigSet,
    manager: ManagerHandle,
    reload: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: Fn() -> Result<ManagementConfig, ConfigError> + Send + 'static,
{
    thread::Builder::new()
        .name("signals".to_string())
        .spawn(move || loop {
            match set.wait() {
                Ok(Signal::SIGHUP) => {
                    info!("SIGHUP received, reloading configuration");
                    reload_config(&manager, &reload);
                }
                Ok(signal) => {
                    info!("{:?} received, shutting down", signal);
                    manager.shutdown();
                    return;
                }
                Err(e) => {
                    warn!("sigwait failed: {}", e);
                    manager.shutdown();
                    return;
                }
            }
        })
}
