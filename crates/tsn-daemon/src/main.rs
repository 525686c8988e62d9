//! TSN pub/sub daemon entry point.
//!
//! Starts the subscriber, user-application and publisher tasks on a common
//! phase grid, drives the loopback engine through the cycle registry, and
//! dumps the measurement logs on shutdown.

mod loopback;
mod signals;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tsn_common::config::TsnConfig;
use tsn_runtime::clock::CycleClock;
use tsn_runtime::executor::{run_user_application_loop, CycleTimeline, LoopContext, UserApplication};
use tsn_runtime::measurement::{MeasurementFiles, MeasurementLogger};
use tsn_runtime::realtime::{check_rt_capabilities, lock_memory};
use tsn_runtime::registry::CycleRegistry;
use tsn_runtime::runner::{spawn_rt_task, RtTaskSpec};
use tsn_runtime::shutdown::ShutdownSignal;
use tsn_runtime::slots::CounterSlots;

use crate::loopback::LoopbackEngine;
use crate::signals::SignalHandler;

/// How often the main thread checks for signals.
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// TSN pub/sub daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "tsn-pubsub",
    about = "Phase-staggered real-time TSN publisher/subscriber",
    version,
    long_about = None
)]
struct Args {
    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Network interface for the pub/sub connection.
    #[arg(long, short = 'i')]
    interface: Option<String>,

    /// Cycle time in milliseconds.
    #[arg(long)]
    cycle_time_ms: Option<f64>,

    /// Socket priority of the publish connection.
    #[arg(long)]
    socket_priority: Option<i32>,

    /// Real-time priority of the publisher task.
    #[arg(long)]
    pub_priority: Option<u8>,

    /// Real-time priority of the subscriber task.
    #[arg(long)]
    sub_priority: Option<u8>,

    /// Real-time priority of the user-application task.
    #[arg(long)]
    user_app_priority: Option<u8>,

    /// CPU core of the publisher task.
    #[arg(long)]
    pub_core: Option<usize>,

    /// CPU core of the subscriber task.
    #[arg(long)]
    sub_core: Option<usize>,

    /// CPU core of the user-application task.
    #[arg(long)]
    user_app_core: Option<usize>,

    /// Publish address, e.g. `opc.eth://01-00-5E-7F-00-01:8.3`.
    #[arg(long)]
    pub_mac_address: Option<String>,

    /// Subscribe address, e.g. `opc.eth://01-00-5E-00-00-01:8.3`.
    #[arg(long)]
    sub_mac_address: Option<String>,

    /// Qbv offset added to the transmission time, in nanoseconds.
    #[arg(long, value_name = "NS")]
    qbv_offset: Option<u64>,

    /// Do not request SO_TXTIME for published frames.
    #[arg(long)]
    disable_so_txtime: bool,

    /// Record publish/subscribe counters and write them as CSV on exit.
    #[arg(long)]
    enable_csv_log: bool,

    /// Directory for the CSV logs.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting TSN pub/sub daemon");

    let mut config = load_config(&args)?;
    apply_overrides(&mut config, &args);
    check_config(&config)?;

    info!(
        cycle_time_ms = config.cycle_time_ms,
        cycle_ns = config.cycle_ns(),
        qbv_offset_ns = config.qbv_offset_ns,
        clock = ?config.clock,
        "Configuration loaded"
    );

    run_daemon(&config)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!("tsn_daemon={level},tsn_runtime={level},tsn_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `TSN_PUBSUB_CONFIG` environment variable
/// 3. `/etc/tsn-pubsub/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<TsnConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return TsnConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("TSN_PUBSUB_CONFIG") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from TSN_PUBSUB_CONFIG");
            return TsnConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from TSN_PUBSUB_CONFIG={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "TSN_PUBSUB_CONFIG set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/tsn-pubsub/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return TsnConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(TsnConfig::default())
}

/// Command-line values take precedence over the configuration file.
fn apply_overrides(config: &mut TsnConfig, args: &Args) {
    if let Some(interface) = &args.interface {
        config.transport.interface = Some(interface.clone());
    }
    if let Some(cycle_time_ms) = args.cycle_time_ms {
        config.cycle_time_ms = cycle_time_ms;
    }
    if let Some(priority) = args.socket_priority {
        config.transport.socket_priority = priority;
    }

    let rt = &mut config.realtime;
    if let Some(priority) = args.pub_priority {
        rt.publisher.priority = priority;
    }
    if let Some(priority) = args.sub_priority {
        rt.subscriber.priority = priority;
    }
    if let Some(priority) = args.user_app_priority {
        rt.user_application.priority = priority;
    }
    if let Some(core) = args.pub_core {
        rt.publisher.core = core;
    }
    if let Some(core) = args.sub_core {
        rt.subscriber.core = core;
    }
    if let Some(core) = args.user_app_core {
        rt.user_application.core = core;
    }

    if let Some(address) = &args.pub_mac_address {
        config.transport.publish_address = address.clone();
    }
    if let Some(address) = &args.sub_mac_address {
        config.transport.subscribe_address = address.clone();
    }
    if let Some(offset) = args.qbv_offset {
        config.qbv_offset_ns = offset;
    }
    if args.disable_so_txtime {
        config.transport.so_txtime = false;
    }
    if args.enable_csv_log {
        config.measurement.enabled = true;
    }
    if let Some(dir) = &args.output_dir {
        config.measurement.output_dir = dir.clone();
    }
}

fn check_config(config: &TsnConfig) -> Result<()> {
    if config.transport.interface.as_deref().map_or(true, str::is_empty) {
        bail!("no network interface configured; pass --interface or set transport.interface");
    }
    config.validate().context("Invalid configuration")?;
    Ok(())
}

/// Start all tasks, wait for shutdown, then tear down and flush the logs.
fn run_daemon(config: &TsnConfig) -> Result<()> {
    check_rt_capabilities().report(&config.realtime);
    if config.realtime.lock_memory {
        lock_memory().context("Failed to lock memory")?;
    }

    let shutdown = ShutdownSignal::new();
    let signals =
        SignalHandler::install(shutdown.clone()).context("Failed to set up signal handlers")?;

    let slots = CounterSlots::allocate().context("Failed to allocate external value slots")?;
    let (logger, log_files) = if config.measurement.enabled {
        let files = open_log_files(config)?;
        let logger = MeasurementLogger::new(config.measurement.capacity, shutdown.clone())
            .context("Failed to reserve measurement logs")?;
        (Some(logger), Some(files))
    } else {
        (None, None)
    };

    let timeline = CycleTimeline::starting_now(config).context("Failed to read the cycle clock")?;
    let ctx = LoopContext::new(timeline, shutdown.clone(), config.deadline_miss);
    let registry = CycleRegistry::new(config.clone(), ctx.clone());

    let engine = LoopbackEngine::new(slots.clone(), config);
    let handles = engine
        .start(&registry)
        .context("Failed to register engine cycles")?;

    let phase = config.phases.user_application;
    let clock: CycleClock = timeline.clock();
    let spec = RtTaskSpec::from_config(
        "tsn-user-app",
        config.realtime.policy,
        &config.realtime.user_application,
    );
    let user_app = spawn_rt_task(spec, move || {
        let mut app = UserApplication::new(slots, clock, logger);
        let outcome = run_user_application_loop(&ctx, phase, &mut app);
        Ok((app.into_logger(), outcome))
    });
    let user_app = match user_app {
        Ok(task) => task,
        Err(e) => {
            shutdown.request_shutdown("user application failed to start");
            registry.remove_all();
            return Err(e).context("Failed to start user application task");
        }
    };

    info!(cycles = handles.len(), "All tasks running");
    signals.wait_for_shutdown(SIGNAL_POLL_INTERVAL);
    info!("Shutting down...");

    let (logger, mut first_error) = match user_app.join() {
        Ok((logger, outcome)) => (logger, outcome.err()),
        Err(e) => (None, Some(e)),
    };

    for handle in handles {
        if let Err(e) = registry.stop_cycle(handle) {
            error!(%handle, error = %e, "Cyclic task failed");
            first_error.get_or_insert(e);
        }
    }

    if let (Some(logger), Some(files)) = (logger, log_files) {
        logger
            .write_to(files)
            .context("Failed to write measurement logs")?;
    }

    if let Some(e) = first_error {
        return Err(e).context("Real-time task failed");
    }

    info!(
        frames = engine.frame().sequence(),
        "Daemon shutdown complete"
    );
    Ok(())
}

/// Create the output directory and both CSV files before any task runs.
fn open_log_files(config: &TsnConfig) -> Result<MeasurementFiles> {
    let measurement = &config.measurement;
    let files = MeasurementFiles::create(&measurement.publisher_path(), &measurement.subscriber_path())
        .with_context(|| {
            format!(
                "Cannot create measurement logs in {}",
                measurement.output_dir.display()
            )
        })?;
    let (publish, subscribe) = files.paths();
    info!(publish = %publish.display(), subscribe = %subscribe.display(), "Measurement logs opened");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tsn_common::config::SchedPolicy;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from([
            "tsn-pubsub",
            "--interface",
            "enp1s0",
            "--cycle-time-ms",
            "0.5",
            "--qbv-offset",
            "250",
            "--disable-so-txtime",
        ]);
        assert_eq!(args.interface.as_deref(), Some("enp1s0"));
        assert_eq!(args.cycle_time_ms, Some(0.5));
        assert_eq!(args.qbv_offset, Some(250));
        assert!(args.disable_so_txtime);
        assert!(!args.enable_csv_log);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_overrides_apply() {
        let args = Args::parse_from([
            "tsn-pubsub",
            "-i",
            "eth0",
            "--pub-priority",
            "90",
            "--sub-core",
            "1",
            "--user-app-core",
            "0",
            "--pub-mac-address",
            "opc.eth://01-00-5E-7F-00-02:8.3",
            "--enable-csv-log",
            "--output-dir",
            "/tmp/tsn",
            "--disable-so-txtime",
        ]);
        let mut config = TsnConfig::default();
        apply_overrides(&mut config, &args);

        assert_eq!(config.transport.interface.as_deref(), Some("eth0"));
        assert_eq!(config.realtime.publisher.priority, 90);
        assert_eq!(config.realtime.subscriber.core, 1);
        assert_eq!(config.realtime.user_application.core, 0);
        assert_eq!(config.transport.publish_address, "opc.eth://01-00-5E-7F-00-02:8.3");
        assert!(config.measurement.enabled);
        assert_eq!(config.measurement.output_dir, PathBuf::from("/tmp/tsn"));
        assert!(!config.transport.so_txtime);
        // Untouched values keep their defaults
        assert_eq!(config.realtime.subscriber.priority, 81);
        assert_eq!(config.qbv_offset_ns, 125);
    }

    #[test]
    fn test_missing_interface_rejected() {
        let config = TsnConfig::default();
        assert!(check_config(&config).is_err());
    }

    #[test]
    fn test_bad_cycle_time_rejected() {
        let mut config = TsnConfig::default();
        config.transport.interface = Some("eth0".into());
        config.cycle_time_ms = 0.0;
        assert!(check_config(&config).is_err());
        config.cycle_time_ms = 0.125;
        check_config(&config).unwrap();
    }

    #[test]
    fn test_load_config_from_argument() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "cycle_time_ms = 1.0\n[realtime]\npolicy = \"other\"\n[transport]\ninterface = \"veth0\""
        )
        .unwrap();

        let args = Args::parse_from(["tsn-pubsub", "-c", file.path().to_str().unwrap()]);
        let config = load_config(&args).unwrap();
        assert!((config.cycle_time_ms - 1.0).abs() < f64::EPSILON);
        assert_eq!(config.realtime.policy, SchedPolicy::Other);
        assert_eq!(config.transport.interface.as_deref(), Some("veth0"));
        check_config(&config).unwrap();
    }

    #[test]
    fn test_log_files_created_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = TsnConfig::default();
        config.measurement.output_dir = dir.path().join("run1");

        let files = open_log_files(&config).unwrap();
        assert!(config.measurement.publisher_path().exists());
        assert!(config.measurement.subscriber_path().exists());
        drop(files);
    }

    #[test]
    fn test_unwritable_output_dir_fails_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("plain-file");
        std::fs::write(&blocker, b"").unwrap();

        let mut config = TsnConfig::default();
        config.measurement.output_dir = blocker.join("logs");
        let err = open_log_files(&config).unwrap_err();
        assert!(err.to_string().contains("Cannot create measurement logs"));
    }

    #[test]
    fn test_load_config_missing_file_fails() {
        let args = Args::parse_from(["tsn-pubsub", "-c", "/nonexistent/tsn.toml"]);
        assert!(load_config(&args).is_err());
    }
}
