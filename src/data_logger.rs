//! Background PV sampling into the scan's `.dat` file.
//!
//! The logger runs on its own thread for the whole scan. It only reads PVs,
//! so it needs no coordination with the scan driver beyond a stop signal.

use crate::context::{timestamp, ScanContext, Stamp, StatusChannel};
use crate::error::ScanError;
use crate::plotting::plot_sample_times;
use crate::pv::Pv;
use crate::utils::secs;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Upper bound on samples per scan.
pub const MAX_SAMPLES: usize = 1_000_000;

#[derive(Debug, Clone, PartialEq)]
pub struct LoggerSettings {
    pub interval: Duration,
    /// Column-aligned output, written when the logger stops
    pub formatted: bool,
    pub plot_times: bool,
    pub max_samples: usize,
}

impl LoggerSettings {
    pub fn from_config(ctx: &ScanContext) -> Self {
        Self {
            interval: secs(ctx.f64_or("DATA:INT", 1.0)),
            formatted: ctx.flag("DATA:FORMAT"),
            plot_times: ctx.flag("DATA:PLOTTIMES"),
            max_samples: MAX_SAMPLES,
        }
    }
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            formatted: false,
            plot_times: false,
            max_samples: MAX_SAMPLES,
        }
    }
}

/// Read the optional per-prefix PV list: one name per line, `#` comments.
pub fn read_pv_list(path: &Path) -> Result<Vec<String>, ScanError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ScanError::io(e, format!("reading PV list {}", path.display())))?;
    Ok(text
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Name whose `.DESC` field describes `name`.
fn description_base(name: &str) -> String {
    name.replace(".RBV", "").replace(".RVAL", "")
}

fn sample_value(pv: &Pv) -> String {
    pv.get()
        .map(|v| v.as_string())
        .unwrap_or_else(|| "Invalid".to_string())
}

pub struct DataLogger {
    pvs: Vec<Pv>,
    descriptions: Vec<String>,
    path: PathBuf,
    settings: LoggerSettings,
}

impl DataLogger {
    /// Logger over `pvs`, writing to `path`. Unreachable PVs are dropped
    /// with a status message.
    pub fn new(
        ctx: &ScanContext,
        path: PathBuf,
        pvs: Vec<Pv>,
        settings: LoggerSettings,
    ) -> Self {
        let status = ctx.status();
        let pvs: Vec<Pv> = pvs
            .into_iter()
            .filter(|pv| {
                let ok = pv.connected();
                if !ok {
                    status.print_msg(&format!("PV {} invalid: removed from Data Logger", pv.name()));
                }
                ok
            })
            .collect();

        // Descriptions are read up front so the sampling thread only touches
        // the PVs it logs.
        let descriptions = pvs
            .iter()
            .map(|pv| {
                ctx.pv(&format!("{}.DESC", description_base(pv.name())))
                    .get_string()
                    .unwrap_or_default()
            })
            .collect();

        Self {
            pvs,
            descriptions,
            path,
            settings,
        }
    }

    /// Build the scan's logger.
    ///
    /// PVs are logged in this order: `monitor` (grabber PVs), the site PV
    /// list for this prefix, then `extra` (device and shutter PVs). The file
    /// is `<filepath><scan start>.dat` and its name is published to
    /// `DATA:FILENAME`.
    pub fn from_config(
        ctx: &ScanContext,
        filepath: &str,
        monitor: Vec<Pv>,
        extra: Vec<Pv>,
    ) -> Result<Self, ScanError> {
        let mut pvs = monitor;

        if let Some(home) = ctx.home_dir() {
            let list = home
                .join(&ctx.paths().data_logger_dir)
                .join(format!("pvlist-{}", ctx.prefix().replace(':', "_")));
            if list.is_file() {
                let names = read_pv_list(&list)?;
                debug!("{} PVs from {}", names.len(), list.display());
                pvs.extend(names.iter().map(|n| ctx.pv(n)));
            }
        }
        pvs.extend(extra);

        let path = PathBuf::from(format!("{}{}.dat", filepath, ctx.started()));
        ctx.config_pv("DATA:FILENAME")
            .put_str(&path.to_string_lossy())?;

        Ok(Self::new(ctx, path, pvs, LoggerSettings::from_config(ctx)))
    }

    pub fn pvs(&self) -> &[Pv] {
        &self.pvs
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &LoggerSettings {
        &self.settings
    }

    fn write_header<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        writeln!(out, "{:<30} PV description", "PV name")?;
        for (pv, desc) in self.pvs.iter().zip(&self.descriptions) {
            writeln!(out, "{:<30} {}", description_base(pv.name()), desc)?;
        }
        writeln!(out, "{}", "#".repeat(50))
    }

    /// One sample row; returns the values and the mean read time per PV.
    fn sample(&self) -> (Vec<String>, f64) {
        let start = Instant::now();
        let values: Vec<String> = self.pvs.iter().map(sample_value).collect();
        let per_pv = start.elapsed().as_secs_f64() / self.pvs.len().max(1) as f64;
        (values, per_pv)
    }

    /// Sampling loop. Stops on a stop signal, a dropped sender or the sample
    /// cap, and returns the per-sample read times.
    fn run<W: Write>(
        &self,
        out: &mut W,
        stop: &crossbeam_channel::Receiver<()>,
    ) -> Result<Vec<f64>, ScanError> {
        let io_err = |e| ScanError::io(e, format!("writing {}", self.path.display()));
        self.write_header(out).map_err(io_err)?;

        let mut times = Vec::new();
        let mut table: Vec<Vec<String>> = Vec::new();
        let mut heading = vec!["Timestamp".to_string()];
        heading.extend(self.pvs.iter().map(|pv| pv.name().to_string()));

        if self.settings.formatted {
            table.push(heading);
        } else {
            writeln!(out, "{} ", heading.join(" ")).map_err(io_err)?;
        }

        let mut count = 0;
        while count < self.settings.max_samples {
            let started = Instant::now();
            let stamp = timestamp(Stamp::Micros);
            let (values, per_pv) = self.sample();
            if self.settings.plot_times {
                times.push(per_pv);
            }

            if self.settings.formatted {
                let mut row = vec![stamp];
                row.extend(values);
                table.push(row);
            } else {
                writeln!(out, "{} {} ", stamp, values.join(" ")).map_err(io_err)?;
                out.flush().map_err(io_err)?;
            }
            count += 1;

            let remaining = self.settings.interval.saturating_sub(started.elapsed());
            match stop.recv_timeout(remaining) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        if count >= self.settings.max_samples {
            warn!("Data logger reached {} samples, stopping", self.settings.max_samples);
        }

        if self.settings.formatted {
            write_columns(out, &table).map_err(io_err)?;
        }
        out.flush().map_err(io_err)?;
        debug!("Data logger wrote {} samples", count);
        Ok(times)
    }

    /// Create the output file and start sampling in the background.
    pub fn start(self, status: &StatusChannel) -> Result<DataLoggerHandle, ScanError> {
        let file = File::create(&self.path)
            .map_err(|e| ScanError::io(e, format!("creating {}", self.path.display())))?;
        let plot_times = self.settings.plot_times;
        let (stop_tx, stop_rx) = bounded::<()>(1);

        status.print_msg(&format!("Data logging to {}", self.path.display()));
        let thread = thread::spawn(move || -> Result<Vec<f64>, ScanError> {
            info!("Started data logger thread for {} PVs", self.pvs.len());
            let mut out = BufWriter::new(file);
            self.run(&mut out, &stop_rx)
        });

        Ok(DataLoggerHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            plot_times,
        })
    }
}

/// Left-justified columns, each one character wider than its longest cell.
fn write_columns<W: Write>(out: &mut W, rows: &[Vec<String>]) -> std::io::Result<()> {
    let columns = rows.first().map(Vec::len).unwrap_or(0);
    let widths: Vec<usize> = (0..columns)
        .map(|c| rows.iter().filter_map(|r| r.get(c)).map(String::len).max().unwrap_or(0) + 1)
        .collect();
    for row in rows {
        for (cell, width) in row.iter().zip(&widths) {
            write!(out, "{:<width$}", cell, width = *width)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// A running data logger. Stopping joins the thread; dropping stops it too.
pub struct DataLoggerHandle {
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<Result<Vec<f64>, ScanError>>>,
    plot_times: bool,
}

impl DataLoggerHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the thread, wait for it and plot sample times if requested.
    pub fn stop(&mut self) -> Result<(), ScanError> {
        if let Some(tx) = self.stop_tx.take() {
            // The thread may already have hit the sample cap
            let _ = tx.try_send(());
        }
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let times = thread
            .join()
            .map_err(|_| ScanError::Config("data logger thread panicked".to_string()))??;

        if self.plot_times && !times.is_empty() {
            if let Err(e) = plot_sample_times(&times, None, None) {
                warn!("Could not plot sample times: {}", e);
            }
        }
        Ok(())
    }
}

impl Drop for DataLoggerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Data logger stopped with error: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sim_context;

    fn fast(formatted: bool) -> LoggerSettings {
        LoggerSettings {
            interval: Duration::from_millis(2),
            formatted,
            plot_times: false,
            max_samples: MAX_SAMPLES,
        }
    }

    #[test]
    fn test_pv_list_skips_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pvlist-UED_DAQ");
        std::fs::write(&path, "# vacuum\nVAC:GAUGE1\n\n  LASER:POWER  \n#OFF:PV\n").unwrap();
        assert_eq!(read_pv_list(&path).unwrap(), vec!["VAC:GAUGE1", "LASER:POWER"]);
    }

    #[test]
    fn test_unconnected_pvs_removed() {
        let (sim, ctx) = sim_context();
        sim.set("A:VAL", 1.0);
        let logger = DataLogger::new(
            &ctx,
            PathBuf::from("unused.dat"),
            vec![ctx.pv("A:VAL"), ctx.pv("B:MISSING")],
            fast(false),
        );
        assert_eq!(logger.pvs().len(), 1);
        assert!(ctx
            .status()
            .console()
            .lines()
            .iter()
            .any(|l| l.ends_with("PV B:MISSING invalid: removed from Data Logger")));
    }

    #[test]
    fn test_header_uses_record_descriptions() {
        let (sim, ctx) = sim_context();
        sim.set("MOTR:X.RBV", 0.5);
        sim.set("MOTR:X.DESC", "Sample X");
        let logger = DataLogger::new(&ctx, PathBuf::new(), vec![ctx.pv("MOTR:X.RBV")], fast(false));

        let mut out = Vec::new();
        logger.write_header(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], format!("{:<30} PV description", "PV name"));
        assert_eq!(lines[1], format!("{:<30} Sample X", "MOTR:X"));
        assert_eq!(lines[2], "#".repeat(50));
    }

    #[test]
    fn test_plain_logging_until_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, ctx) = sim_context();
        sim.set("A:VAL", 1.5);
        sim.set("B:VAL", 2);
        let path = dir.path().join("scan.dat");
        let logger = DataLogger::new(
            &ctx,
            path.clone(),
            vec![ctx.pv("A:VAL"), ctx.pv("B:VAL")],
            fast(false),
        );

        let mut handle = logger.start(ctx.status()).unwrap();
        thread::sleep(Duration::from_millis(20));
        sim.disconnect("B:VAL");
        thread::sleep(Duration::from_millis(10));
        handle.stop().unwrap();
        assert!(!handle.is_running());

        let text = std::fs::read_to_string(&path).unwrap();
        let rows: Vec<&str> = text.lines().skip(5).collect();
        assert_eq!(text.lines().nth(4).unwrap(), "Timestamp A:VAL B:VAL ");
        assert!(rows.len() >= 2);
        assert!(rows[0].ends_with(" 1.5 2 "));
        assert!(rows.last().unwrap().ends_with(" 1.5 Invalid "));
    }

    #[test]
    fn test_formatted_columns() {
        let (sim, ctx) = sim_context();
        sim.set("LONG:PV:NAME", 3);
        let mut settings = fast(true);
        settings.max_samples = 2;
        let logger = DataLogger::new(&ctx, PathBuf::new(), vec![ctx.pv("LONG:PV:NAME")], settings);

        let (_tx, rx) = bounded::<()>(1);
        let mut out = Vec::new();
        logger.run(&mut out, &rx).unwrap();
        let text = String::from_utf8(out).unwrap();
        let rows: Vec<&str> = text.lines().skip(3).collect();
        assert_eq!(rows.len(), 3);

        let stamp_width = timestamp(Stamp::Micros).len() + 1;
        assert_eq!(rows[0], format!("{:<w$}{:<13}", "Timestamp", "LONG:PV:NAME", w = stamp_width));
        assert!(rows[1].ends_with(&format!("{:<13}", "3")));
    }

    #[test]
    fn test_sample_cap_ends_thread() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, ctx) = sim_context();
        sim.set("A:VAL", 1);
        let mut settings = fast(false);
        settings.max_samples = 3;
        settings.interval = Duration::ZERO;
        let logger = DataLogger::new(&ctx, dir.path().join("cap.dat"), vec![ctx.pv("A:VAL")], settings);
        let mut handle = logger.start(ctx.status()).unwrap();
        thread::sleep(Duration::from_millis(20));
        handle.stop().unwrap();
        let text = std::fs::read_to_string(dir.path().join("cap.dat")).unwrap();
        assert_eq!(text.lines().count(), 3 + 1 + 3);
    }

    #[test]
    fn test_from_config_publishes_filename() {
        let dir = tempfile::tempdir().unwrap();
        let (sim, ctx) = sim_context();
        sim.set("TEST:DATA:INT", 0.5);
        let filepath = format!("{}/", dir.path().display());
        let logger = DataLogger::from_config(&ctx, &filepath, Vec::new(), Vec::new()).unwrap();
        let expected = format!("{}{}.dat", filepath, ctx.started());
        assert_eq!(logger.path(), Path::new(&expected));
        assert_eq!(logger.settings().interval, Duration::from_millis(500));
        assert_eq!(
            sim.value("TEST:DATA:FILENAME").unwrap().as_string(),
            expected
        );
    }
}
