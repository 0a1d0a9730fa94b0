//! Multi-run wrapper: runs the configured scan program N times, giving each
//! run its own output directory and scan ID.

use crate::context::ScanContext;
use crate::error::ScanError;
use crate::utils::pause;
use chrono::Local;
use log::{debug, warn};
use std::path::Path;
use std::process::Command;

/// Starts one scan and waits for it to exit.
pub trait ScanLauncher {
    fn launch(&mut self, script: &str, prefix: &str) -> Result<(), ScanError>;
}

/// Runs `<script> <prefix>` as a child process.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl ScanLauncher for CommandLauncher {
    fn launch(&mut self, script: &str, prefix: &str) -> Result<(), ScanError> {
        let status = Command::new(script)
            .arg(prefix)
            .status()
            .map_err(|e| ScanError::UserScript(format!("{}: {}", script, e)))?;
        if !status.success() {
            warn!("{} exited with {}", script, status);
        }
        Ok(())
    }
}

/// Parameters of one run, read from the configuration namespace.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub script: String,
    pub n_scans: u32,
    pub filepath: String,
    pub sample_name: String,
    pub exp_name: String,
    /// `YYYYmmdd_HHMM`, shared by the run and scan IDs
    pub started: String,
}

impl RunPlan {
    /// `n_scans` from the command line wins over `N_SCANS` unless it is zero.
    pub fn from_config(ctx: &ScanContext, n_scans: Option<u32>) -> Result<Self, ScanError> {
        let script = ctx.string("SCRIPT");
        if script.is_empty() {
            return Err(ScanError::Config(format!("{}:SCRIPT is empty", ctx.prefix())));
        }

        let n_scans = match n_scans.filter(|&n| n > 0) {
            Some(n) => n,
            None => match ctx.config_pv("N_SCANS").get_i64() {
                Some(n) if n > 0 => n as u32,
                Some(n) => {
                    return Err(ScanError::Config(format!("n_scans must be > 0, got {}", n)));
                }
                None => {
                    warn!("n_scans was unset, running one scan");
                    1
                }
            },
        };

        let now = Local::now();
        let started = now.format("%Y%m%d_%H%M").to_string();
        let sample_name = ctx.string("SCAN:SAMPLE_NAME");
        let filepath = if ctx.flag("DATA:FILEPATH:AUTOSET") {
            let root = data_root(ctx);
            let path = format!(
                "{}{}/{}/{}/{}/",
                root,
                sample_name,
                now.format("%Y%m%d"),
                ctx.string("SCAN:TYPE"),
                started
            );
            ctx.config_pv("DATA:FILEPATH").put_str(&path)?;
            path
        } else {
            ctx.string("DATA:FILEPATH")
        };

        Ok(Self {
            script,
            n_scans,
            filepath,
            sample_name,
            exp_name: ctx.string("EXP:NAME"),
            started,
        })
    }

    pub fn run_id(&self) -> String {
        format!("{}_{}", self.sample_name, self.started)
    }

    /// Output directory of scan `index` (1-based) in a multi-scan run.
    pub fn scan_filepath(&self, index: u32) -> String {
        format!("{}/scan{:03}", self.filepath.trim_end_matches('/'), index)
    }
}

/// Root for generated data paths: the configured data root if present,
/// else the shared home directory.
fn data_root(ctx: &ScanContext) -> String {
    let preferred = &ctx.paths().data_root;
    if Path::new(preferred).exists() {
        return preferred.clone();
    }
    match ctx.home_dir() {
        Some(home) => {
            ctx.status().print_raw(&format!(
                "Filepath {} does not exist, defaulting to NFS...",
                preferred
            ));
            format!("{}/", home.display().to_string().trim_end_matches('/'))
        }
        None => "~/".to_string(),
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub run_id: String,
    pub scans_started: u32,
}

pub struct MultiRunner<L: ScanLauncher = CommandLauncher> {
    ctx: ScanContext,
    plan: RunPlan,
    launcher: L,
}

impl MultiRunner<CommandLauncher> {
    pub fn new(ctx: &ScanContext, plan: RunPlan) -> Self {
        Self::with_launcher(ctx, plan, CommandLauncher)
    }
}

impl<L: ScanLauncher> MultiRunner<L> {
    pub fn with_launcher(ctx: &ScanContext, plan: RunPlan, launcher: L) -> Self {
        Self {
            ctx: ctx.clone(),
            plan,
            launcher,
        }
    }

    pub fn plan(&self) -> &RunPlan {
        &self.plan
    }

    /// Run all scans. `RUNFLAG` is cleared when the run ends, and in a
    /// multi-scan run the original filepath is restored, whatever the
    /// outcome.
    pub fn run(&mut self) -> Result<RunReport, ScanError> {
        let run_flag = self.ctx.run_flag_pv();
        let run_id = self.plan.run_id();
        self.ctx.config_pv("SCAN:COUNT").put(0)?;
        self.ctx.config_pv("RUN:ID").put_str(&run_id)?;
        debug!("Run plan: {:?}", self.plan);

        run_flag.put(1)?;
        pause(self.ctx.timing().idle);

        let result = if self.plan.n_scans == 1 {
            self.single_scan()
        } else {
            self.scan_loop()
        };

        let restored = if self.plan.n_scans > 1 {
            self.ctx.config_pv("DATA:FILEPATH").put_str(&self.plan.filepath)
        } else {
            Ok(())
        };
        let cleared = run_flag.put(0);

        let scans_started = result?;
        restored?;
        cleared?;
        if self.plan.n_scans > 1 {
            self.ctx.status().print_raw(&format!(
                "{} All scans done. {}",
                "*".repeat(15),
                "*".repeat(15)
            ));
        }
        Ok(RunReport {
            run_id,
            scans_started,
        })
    }

    fn single_scan(&mut self) -> Result<u32, ScanError> {
        self.ctx.config_pv("SCAN:COUNT").put(1)?;
        self.ctx
            .config_pv("SCAN:ID")
            .put_str(&format!("{}_{:03}", self.plan.run_id(), 1))?;
        self.launcher.launch(&self.plan.script, self.ctx.prefix())?;
        Ok(1)
    }

    fn scan_loop(&mut self) -> Result<u32, ScanError> {
        let n = self.plan.n_scans;
        let mut started = 0;
        for index in 1..=n {
            if !self.ctx.run_flag_pv().get_bool() {
                self.ctx.status().print_msg("Run flag cleared, stopping");
                break;
            }
            self.ctx.status().print_raw(&format!(
                "{} Scan {:03}/{:03} {}",
                "*".repeat(15),
                index,
                n,
                "*".repeat(15)
            ));

            let filepath = self.plan.scan_filepath(index);
            debug!("Scan {} filepath: {}", index, filepath);
            self.ctx.config_pv("DATA:FILEPATH").put_str(&filepath)?;
            self.ctx.config_pv("SCAN:COUNT").put(index)?;
            self.ctx.config_pv("SCAN:ID").put_str(&format!(
                "{}_{}_{:03}",
                self.plan.exp_name, self.plan.started, index
            ))?;
            pause(self.ctx.timing().sequence_pause);

            self.launcher.launch(&self.plan.script, self.ctx.prefix())?;
            started += 1;
            self.ctx.status().print_raw("");
        }
        Ok(started)
    }
}
