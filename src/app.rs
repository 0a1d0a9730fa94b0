//! Process plumbing shared by the `pvscan` binaries: argument parsing,
//! settings, PV backend selection, logging and failure reporting.

use crate::config::{load_config, load_config_or_default, AppConfig, BackendKind};
use crate::context::{Console, ScanContext};
use crate::error::ScanError;
use crate::pv::{CaToolsBackend, ProcessVariables, SimulatedPvs};
use crate::utils::secs;
use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser};
use env_logger::Env;
use log::{error, info, LevelFilter};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Options every binary accepts.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Configuration PV prefix, e.g. `SCAN:TEST`
    #[arg(value_name = "PV_PREFIX")]
    pub prefix: String,

    /// Path to a site settings file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Run against in-memory PVs seeded from a JSON snapshot
    #[arg(long, value_name = "SNAPSHOT")]
    pub simulate: Option<PathBuf>,
}

/// Parse the command line, printing `Usage: <bin> <usage>` and exiting 1 on
/// anything other than `--help`/`--version`.
pub fn parse_args<T: Parser>(usage: &str) -> T {
    match T::try_parse() {
        Ok(args) => args,
        Err(e) => match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => e.exit(),
            _ => {
                let bin = T::command().get_name().to_string();
                eprintln!("{}", e.render());
                eprintln!("Usage: {} {}", bin, usage);
                std::process::exit(1);
            }
        },
    }
}

pub fn initialize_logging(log_level: &str) -> Result<(), log::SetLoggerError> {
    let level = parse_level(log_level).unwrap_or_else(|| {
        eprintln!("Warning: Invalid log level '{}', using 'info'", log_level);
        LevelFilter::Info
    });

    env_logger::Builder::from_env(Env::default())
        .filter_level(level)
        .format_timestamp_millis()
        .try_init()
}

fn parse_level(log_level: &str) -> Option<LevelFilter> {
    match log_level.to_lowercase().as_str() {
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" => Some(LevelFilter::Warn),
        "error" => Some(LevelFilter::Error),
        _ => None,
    }
}

/// CLI flag first, then the scan's own debug switch, then site settings.
pub fn select_log_level(cli: Option<&str>, debug_enabled: bool, config: &AppConfig) -> String {
    match cli {
        Some(level) => level.to_string(),
        None if debug_enabled => "debug".to_string(),
        None => config.logging.level.clone(),
    }
}

/// An explicit `--config` must load; otherwise fall back to defaults.
pub fn load_settings(path: Option<&Path>) -> Result<AppConfig, ScanError> {
    match path {
        Some(path) => Ok(load_config(Some(path))?),
        None => Ok(load_config_or_default(None)),
    }
}

pub fn build_backend(
    config: &AppConfig,
    simulate: Option<&Path>,
) -> Result<Arc<dyn ProcessVariables>, ScanError> {
    if let Some(snapshot) = simulate {
        return Ok(Arc::new(SimulatedPvs::load_snapshot(snapshot)?));
    }

    match config.backend.kind {
        BackendKind::Simulated => {
            let sim = match &config.backend.snapshot {
                Some(path) => SimulatedPvs::load_snapshot(Path::new(path))?,
                None => SimulatedPvs::new(),
            };
            Ok(Arc::new(sim))
        }
        BackendKind::Ca => {
            let backend = CaToolsBackend::builder()
                .caget(&config.backend.caget)
                .caput(&config.backend.caput)
                .timeout(Duration::from_millis(config.backend.timeout_ms))
                .callback_timeout(secs(config.timeouts.grab_secs))
                .build()?;
            Ok(Arc::new(backend))
        }
    }
}

/// Settings, backend, context and logging, in that order.
pub fn setup(args: &CommonArgs) -> Result<ScanContext, Box<dyn std::error::Error>> {
    let config = load_settings(args.config.as_deref())?;
    let backend = build_backend(&config, args.simulate.as_deref())?;
    let ctx = ScanContext::new(&args.prefix, backend, &config, Console::stdout());

    let level = select_log_level(
        args.log_level.as_deref(),
        ctx.flag("DEBUG:ENABLE"),
        &config,
    );
    initialize_logging(&level)?;
    info!("PV prefix: {}", ctx.prefix());
    if let Some(path) = &args.config {
        info!("Configuration: {}", path.display());
    }
    if let Some(path) = &args.simulate {
        info!("Simulated PVs from {}", path.display());
    }
    Ok(ctx)
}

pub fn setup_shutdown_handler() -> Result<Arc<AtomicBool>, ScanError> {
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received - stopping after the current step...");
        shutdown_flag_clone.store(true, Ordering::SeqCst);
    })
    .map_err(|e| ScanError::Signal(format!("installing Ctrl+C handler: {}", e)))?;

    Ok(shutdown_flag)
}

/// Report the outcome on the status channel. Returns whether the process
/// should exit successfully.
pub fn report<T>(ctx: &ScanContext, result: Result<T, ScanError>) -> bool {
    match result {
        Ok(_) => true,
        Err(ScanError::Interrupted) => {
            info!("Stopped by user");
            ctx.status().print_msg("Stopped by user");
            true
        }
        Err(e) => {
            error!("{}", e);
            ctx.status().fail(&e.to_string());
            false
        }
    }
}

pub fn finish<T>(ctx: &ScanContext, result: Result<T, ScanError>) -> ExitCode {
    if report(ctx, result) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
