mod config;
mod discovery;
mod keys;
mod manager;
mod monitor;
mod property;
#[cfg(target_os = "linux")]
mod signals;
#[cfg(target_os = "linux")]
mod suspend;
#[cfg(test)]
mod testing;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use config::{default_config_path, idle_time_from_secs, ConfigError, ManagementConfig};
use keys::KeyIgnorePolicy;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "padwatch", version)]
#[command(about = "Switches the touchpad off while a mouse is plugged in or while typing")]
struct Cli {
    /// Verbose logging (can be specified multiple times)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Log format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Manage the touchpad until interrupted (the default)
    Run(RunArgs),
    /// List keyboards, mice and touchpads
    Devices,
    /// Show every property of the first touchpad
    Properties,
    /// Print one touchpad property
    Get {
        /// Property name, e.g. touchpad_off or finger_detection
        name: String,
    },
}

#[derive(Args, Clone, Default)]
struct RunArgs {
    /// Configuration file [default: $XDG_CONFIG_HOME/padwatch/config.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds without typing before the touchpad comes back on
    #[arg(long)]
    idle_time: Option<f64>,

    /// Ignore mice
    #[arg(long)]
    no_mouse: bool,

    /// Ignore typing
    #[arg(long)]
    no_keyboard: bool,

    /// Keys that do not count as typing: none, modifiers or modifier-combinations
    #[arg(long)]
    ignore_keys: Option<KeyIgnorePolicy>,

    /// Read each keyboard node directly instead of through libinput
    #[arg(long)]
    no_seat_tap: bool,
}

impl RunArgs {
    fn config_path(&self) -> PathBuf {
        self.config.clone().unwrap_or_else(default_config_path)
    }

    /// Loads the file and applies the command-line overrides on top. Used
    /// for the first load and for every reload.
    fn load(&self, path: &Path) -> Result<ManagementConfig, ConfigError> {
        let mut config = ManagementConfig::load(path)?;
        if let Some(secs) = self.idle_time {
            config.idle_time = idle_time_from_secs(secs)?;
        }
        if self.no_mouse {
            config.monitor_mouse = false;
        }
        if self.no_keyboard {
            config.monitor_keyboard = false;
        }
        if let Some(policy) = self.ignore_keys {
            config.key_ignore_policy = policy;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match cli.command.unwrap_or(Command::Run(RunArgs::default())) {
        Command::Run(args) => linux::run(args),
        Command::Devices => linux::devices(),
        Command::Properties => linux::properties(),
        Command::Get { name } => linux::get(&name),
    }
}

fn init_logging(verbose: u8, format: LogFormat) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("padwatch={},warn", level)));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init(),
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::RunArgs;
    use crate::discovery::udev_discovery::UdevRegistry;
    use crate::discovery::{DeviceClass, DeviceRegistry, InputDevice};
    use crate::manager::runner::{Runner, TouchpadOpener};
    use crate::manager::LogObserver;
    use crate::monitor::keyboard::KeyboardBackend;
    use crate::property::evdev_store::EvdevTouchpad;
    use crate::property::{Property, PropertyError, PropertyStore};
    use crate::{signals, suspend};
    use anyhow::{Context, Result};
    use std::sync::Arc;
    use tracing::{info, warn};

    pub fn run(args: RunArgs) -> Result<()> {
        let path = args.config_path();
        let config = args
            .load(&path)
            .with_context(|| format!("cannot load configuration from {}", path.display()))?;
        info!(
            "idle time {:?}, mouse monitoring {}, keyboard monitoring {} ({:?}), {} ignored mice",
            config.idle_time,
            config.monitor_mouse,
            config.monitor_keyboard,
            config.key_ignore_policy,
            config.ignored_mouse_devices.len()
        );

        let registry: Arc<dyn DeviceRegistry> = Arc::new(UdevRegistry);
        let open_touchpad: TouchpadOpener = Box::new(|touchpad: &InputDevice| {
            EvdevTouchpad::open(touchpad).map(|t| Box::new(t) as Box<dyn PropertyStore>)
        });

        // Must precede every other thread.
        let signal_set = signals::block_signals().context("cannot block signals")?;

        let runner = Runner::new(
            config,
            registry,
            KeyboardBackend::linux(!args.no_seat_tap),
            open_touchpad,
            Box::new(LogObserver),
        );
        let handle = runner.handle();

        signals::spawn_signal_thread(signal_set, handle.clone(), move || args.load(&path))
            .context("cannot start signal thread")?;
        if let Err(e) = suspend::spawn_suspend_watcher(handle) {
            warn!("suspend/resume handling disabled: {}", e);
        }

        runner.run();
        Ok(())
    }

    pub fn devices() -> Result<()> {
        let registry = UdevRegistry;
        for class in [DeviceClass::Touchpad, DeviceClass::Mouse, DeviceClass::Keyboard] {
            for device in registry.list(class)? {
                let node = device
                    .devnode
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |p| p.display().to_string());
                println!("{:<9} {:<20} {}", class.to_string(), node, device.name);
            }
        }
        Ok(())
    }

    fn open_touchpad() -> Result<EvdevTouchpad> {
        let touchpad = UdevRegistry.find_first(DeviceClass::Touchpad)?;
        Ok(EvdevTouchpad::open(&touchpad)?)
    }

    pub fn properties() -> Result<()> {
        let store = open_touchpad()?;
        for property in Property::ALL {
            match store.get(property) {
                Ok(value) => println!("{:<24} {}", property.name(), value),
                Err(e) => println!("{:<24} unavailable ({})", property.name(), e),
            }
        }
        Ok(())
    }

    pub fn get(name: &str) -> Result<()> {
        let property = Property::from_name(name)
            .ok_or_else(|| PropertyError::Unsupported(name.to_string()))?;
        let store = open_touchpad()?;
        println!("{}", store.get(property)?);
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod linux {
    use super::RunArgs;
    use anyhow::{bail, Result};

    pub fn run(_args: RunArgs) -> Result<()> {
        bail!("padwatch needs Linux evdev and udev")
    }

    pub fn devices() -> Result<()> {
        run(RunArgs::default())
    }

    pub fn properties() -> Result<()> {
        run(RunArgs::default())
    }

    pub fn get(_name: &str) -> Result<()> {
        run(RunArgs::default())
    }
}
