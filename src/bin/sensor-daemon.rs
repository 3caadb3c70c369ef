//! CLI entry point: load configuration, set up logging, and run the daemon
//! until a signal requests shutdown.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use sensor_daemon::config::{ConfigError, DaemonConfig};
use sensor_daemon::DaemonResult;
use sensor_daemon::daemon::{Daemon, ShutdownToken};
use sensor_daemon::health::{default_notifier, HealthMonitor};
use sensor_daemon::sensor::transport::Transport;
use sensor_daemon::storage::TimeSeriesStore;

#[derive(Parser)]
#[command(name = "sensor-daemon", version, about = "SCD40 sensor acquisition daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/sensor-daemon/config.toml")]
    config: std::path::PathBuf,

    /// Stay attached to the terminal and log to stderr instead of daemonizing.
    #[arg(short, long)]
    foreground: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match DaemonConfig::load(&cli.config) {
        Ok(config) => config,
        Err(ConfigError::Io { .. }) => {
            eprintln!("no configuration file at {}, using defaults", cli.config.display());
            DaemonConfig::default_config()
        }
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.daemon.log_level, cli.foreground);

    if let Err(e) = run(config) {
        tracing::error!(error = %e, "daemon exited with error");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn init_logging(log_level: &str, foreground: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_ansi(foreground);
    if foreground {
        subscriber.init();
    } else {
        subscriber.without_time().init();
    }
}

fn run(config: DaemonConfig) -> DaemonResult<()> {
    let shutdown = ShutdownToken::new();
    shutdown.install_signal_handlers()?;

    let retention = std::time::Duration::from_secs(config.retention_seconds());
    let store = Arc::new(TimeSeriesStore::open(
        std::path::Path::new(&config.storage.data_directory),
        retention,
    )?);

    let transport = Arc::new(Transport::<linux_embedded_hal::I2cdev>::new(
        config.sensor.i2c_address,
        config.sensor.max_retries,
    ));

    let health = Arc::new(HealthMonitor::new(config.alerts.clone(), default_notifier()));

    let daemon = Daemon::new(config.clone(), Arc::clone(&store), Arc::clone(&transport), Arc::clone(&health), shutdown.clone());
    daemon.register_health_checks();

    let http_handle = daemon.spawn_http_server()?;

    let device_path = config.sensor.i2c_device.clone();
    let open_i2c = move || linux_embedded_hal::I2cdev::new(&device_path).ok();

    daemon.run_acquisition_loop(open_i2c);

    let _ = http_handle.join();
    Ok(())
}
