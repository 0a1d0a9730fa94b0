//! Scan-position correction.
//!
//! While the primary device is scanned, two secondary PVs are driven from a
//! calibration table keyed by the primary target. The table is a text file
//! of whitespace-separated `value cor1 cor2` rows; `#` lines are comments.

use crate::context::{ScanContext, StatusChannel};
use crate::error::ScanError;
use crate::plotting::plot_fit;
use crate::pv::Pv;
use crate::utils::pause;
use log::{debug, info, warn};
use ndarray::Array1;
use std::path::Path;

/// Interpolation kind, named as in `SCANCOR:FITTYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitKind {
    Linear,
    Nearest,
    Previous,
    Next,
    /// Natural cubic spline
    Spline,
}

impl FitKind {
    pub fn from_name(name: &str) -> Result<Self, ScanError> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "linear" | "slinear" => Ok(FitKind::Linear),
            "nearest" => Ok(FitKind::Nearest),
            "zero" | "previous" => Ok(FitKind::Previous),
            "next" => Ok(FitKind::Next),
            "quadratic" | "cubic" => Ok(FitKind::Spline),
            other => Err(ScanError::Correction(format!("unknown fit type {:?}", other))),
        }
    }
}

/// One-dimensional interpolant over a sorted table.
#[derive(Debug, Clone)]
pub struct Interpolator {
    kind: FitKind,
    x: Array1<f64>,
    y: Array1<f64>,
    /// Second derivatives at the knots, spline only
    curvature: Option<Array1<f64>>,
}

impl Interpolator {
    /// `x` must be strictly increasing.
    pub fn new(kind: FitKind, x: Array1<f64>, y: Array1<f64>) -> Result<Self, ScanError> {
        if x.len() != y.len() {
            return Err(ScanError::Correction("column lengths differ".to_string()));
        }
        if x.len() < 2 {
            return Err(ScanError::Correction(
                "correction table needs at least two rows".to_string(),
            ));
        }
        if x.windows(2).into_iter().any(|w| w[1] <= w[0]) {
            return Err(ScanError::Correction(
                "correction table values must be distinct".to_string(),
            ));
        }
        let curvature = match kind {
            FitKind::Spline => Some(natural_spline(&x, &y)),
            _ => None,
        };
        Ok(Self {
            kind,
            x,
            y,
            curvature,
        })
    }

    pub fn range(&self) -> (f64, f64) {
        (self.x[0], self.x[self.x.len() - 1])
    }

    pub fn eval(&self, at: f64) -> Result<f64, ScanError> {
        let (lo, hi) = self.range();
        if !(lo..=hi).contains(&at) {
            return Err(ScanError::Correction(format!(
                "{} is outside the correction table range [{}, {}]",
                at, lo, hi
            )));
        }

        let n = self.x.len();
        // Interval [x[k], x[k+1]] containing `at`
        let k = self
            .x
            .iter()
            .position(|&v| v > at)
            .map(|i| i - 1)
            .unwrap_or(n - 2);
        let (x0, x1) = (self.x[k], self.x[k + 1]);
        let (y0, y1) = (self.y[k], self.y[k + 1]);
        let h = x1 - x0;

        let value = match self.kind {
            FitKind::Linear => y0 + (y1 - y0) * (at - x0) / h,
            FitKind::Nearest => {
                if at - x0 <= x1 - at {
                    y0
                } else {
                    y1
                }
            }
            FitKind::Previous => {
                if at == x1 {
                    y1
                } else {
                    y0
                }
            }
            FitKind::Next => {
                if at == x0 {
                    y0
                } else {
                    y1
                }
            }
            FitKind::Spline => {
                let m = self.curvature.as_ref().ok_or_else(|| {
                    ScanError::Correction("spline coefficients missing".to_string())
                })?;
                let a = (x1 - at) / h;
                let b = (at - x0) / h;
                a * y0
                    + b * y1
                    + ((a.powi(3) - a) * m[k] + (b.powi(3) - b) * m[k + 1]) * h * h / 6.0
            }
        };
        Ok(value)
    }

    /// `points` evenly spaced samples of the fit across the table range.
    pub fn sample(&self, points: usize) -> Vec<(f64, f64)> {
        let (lo, hi) = self.range();
        let points = points.max(2);
        (0..points)
            .filter_map(|i| {
                let x = if i == points - 1 {
                    hi
                } else {
                    lo + (hi - lo) * i as f64 / (points - 1) as f64
                };
                self.eval(x).ok().map(|y| (x, y))
            })
            .collect()
    }
}

/// Second derivatives of the natural cubic spline through `(x, y)`,
/// solved with the Thomas algorithm.
fn natural_spline(x: &Array1<f64>, y: &Array1<f64>) -> Array1<f64> {
    let n = x.len();
    let mut m = Array1::<f64>::zeros(n);
    if n < 3 {
        return m;
    }

    let h: Vec<f64> = (0..n - 1).map(|i| x[i + 1] - x[i]).collect();
    let inner = n - 2;
    let mut diag = vec![0.0; inner];
    let mut upper = vec![0.0; inner];
    let mut rhs = vec![0.0; inner];
    for j in 0..inner {
        let i = j + 1;
        diag[j] = 2.0 * (h[i - 1] + h[i]);
        upper[j] = h[i];
        rhs[j] = 6.0 * ((y[i + 1] - y[i]) / h[i] - (y[i] - y[i - 1]) / h[i - 1]);
    }

    for j in 1..inner {
        let lower = h[j];
        let w = lower / diag[j - 1];
        diag[j] -= w * upper[j - 1];
        rhs[j] -= w * rhs[j - 1];
    }
    let mut solution = vec![0.0; inner];
    solution[inner - 1] = rhs[inner - 1] / diag[inner - 1];
    for j in (0..inner - 1).rev() {
        solution[j] = (rhs[j] - upper[j] * solution[j + 1]) / diag[j];
    }
    for (j, value) in solution.into_iter().enumerate() {
        m[j + 1] = value;
    }
    m
}

/// Calibration table columns, sorted by the key column.
#[derive(Debug, Clone)]
pub struct CorrectionTable {
    pub values: Array1<f64>,
    pub first: Array1<f64>,
    pub second: Array1<f64>,
}

impl CorrectionTable {
    pub fn parse(text: &str) -> Result<Self, ScanError> {
        let mut rows: Vec<[f64; 3]> = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return Err(ScanError::Correction(format!(
                    "line {}: expected 3 columns, found {}",
                    lineno + 1,
                    fields.len()
                )));
            }
            let mut row = [0.0; 3];
            for (slot, field) in row.iter_mut().zip(&fields) {
                *slot = field.parse().map_err(|_| {
                    ScanError::Correction(format!("line {}: {:?} is not a number", lineno + 1, field))
                })?;
            }
            rows.push(row);
        }
        rows.sort_by(|a, b| a[0].total_cmp(&b[0]));

        let column = |i: usize| rows.iter().map(|r| r[i]).collect::<Array1<f64>>();
        Ok(Self {
            values: column(0),
            first: column(1),
            second: column(2),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ScanError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ScanError::io(e, format!("reading correction table {}", path.display())))?;
        Self::parse(&text)
    }
}

/// Drives two correction PVs from the primary device's target position.
pub struct ScanCorrection {
    targets: [Pv; 2],
    initial: [f64; 2],
    fits: [Interpolator; 2],
    table: CorrectionTable,
    scales: [Pv; 2],
    absolute: Pv,
    show_plot: bool,
    status: StatusChannel,
}

impl ScanCorrection {
    pub fn from_config(ctx: &ScanContext) -> Result<Self, ScanError> {
        let name1 = ctx.string("SCANCOR:PVNAME1");
        let name2 = ctx.string("SCANCOR:PVNAME2");
        if name1.is_empty() || name2.is_empty() {
            return Err(ScanError::Config(
                "scan correction needs SCANCOR:PVNAME1 and SCANCOR:PVNAME2".to_string(),
            ));
        }
        let targets = [ctx.pv(&name1), ctx.pv(&name2)];
        pause(ctx.timing().correction_init);

        let read_initial = |pv: &Pv| {
            pv.get_f64()
                .ok_or_else(|| ScanError::InvalidPv(pv.name().to_string()))
        };
        let initial = [read_initial(&targets[0])?, read_initial(&targets[1])?];

        let path = ctx.string("SCANCOR:PATH");
        if path.is_empty() {
            return Err(ScanError::Correction("path is zero length".to_string()));
        }
        let kind = FitKind::from_name(&ctx.string("SCANCOR:FITTYPE"))?;
        let table = CorrectionTable::load(Path::new(&path))?;
        info!(
            "Loaded {} correction rows from {} ({:?} fit)",
            table.values.len(),
            path,
            kind
        );

        let fits = [
            Interpolator::new(kind, table.values.clone(), table.first.clone())?,
            Interpolator::new(kind, table.values.clone(), table.second.clone())?,
        ];

        Ok(Self {
            targets,
            initial,
            fits,
            table,
            scales: [
                ctx.config_pv("SCANCOR:PVSCALE1"),
                ctx.config_pv("SCANCOR:PVSCALE2"),
            ],
            absolute: ctx.config_pv("SCANCOR:CORRTYPE"),
            show_plot: ctx.flag("SCANCOR:SHOWPLOT"),
            status: ctx.status().clone(),
        })
    }

    /// Values the correction PVs are restored to.
    pub fn initial(&self) -> [f64; 2] {
        self.initial
    }

    /// Correction values for a primary target. Scale and correction type are
    /// re-read each call so they can be tuned during a scan.
    pub fn values_for(&self, target: f64) -> Result<[f64; 2], ScanError> {
        let absolute = self.absolute.get_bool();
        let mut out = [0.0; 2];
        for (i, slot) in out.iter_mut().enumerate() {
            let scale = self.scales[i].get_f64().unwrap_or(1.0);
            let fitted = scale * self.fits[i].eval(target)?;
            *slot = if absolute {
                fitted
            } else {
                self.initial[i] + fitted
            };
        }
        Ok(out)
    }

    pub fn set(&self, target: f64) -> Result<(), ScanError> {
        let values = self.values_for(target)?;
        for (pv, value) in self.targets.iter().zip(values) {
            self.status
                .print_msg(&format!("Setting {} to {:.6}", pv.name(), value));
            pv.put(value)?;
        }
        Ok(())
    }

    pub fn reset(&self) -> Result<(), ScanError> {
        for (pv, value) in self.targets.iter().zip(self.initial) {
            self.status
                .print_msg(&format!("Resetting {} back to {:.6}", pv.name(), value));
            pv.put(value)?;
        }
        Ok(())
    }

    /// Show both fits in the terminal when `SCANCOR:SHOWPLOT` is set.
    pub fn plot(&self) {
        if !self.show_plot {
            return;
        }
        let columns = [&self.table.first, &self.table.second];
        for (i, (fit, column)) in self.fits.iter().zip(columns).enumerate() {
            let points: Vec<(f64, f64)> = self
                .table
                .values
                .iter()
                .zip(column.iter())
                .map(|(&x, &y)| (x, y))
                .collect();
            let title = format!("Correction {} ({})", i + 1, self.targets[i].name());
            if let Err(e) = plot_fit(&title, &points, &fit.sample(100), None, None) {
                warn!("Could not plot correction {}: {}", i + 1, e);
            }
        }
        debug!("Plotted scan correction fits");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sim_context;
    use ndarray::array;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_fit_kind_names() {
        assert_eq!(FitKind::from_name("linear").unwrap(), FitKind::Linear);
        assert_eq!(FitKind::from_name("zero").unwrap(), FitKind::Previous);
        assert_eq!(FitKind::from_name("Cubic").unwrap(), FitKind::Spline);
        assert!(FitKind::from_name("lagrange").is_err());
    }

    #[test]
    fn test_linear_and_step_kinds() {
        let x = array![0.0, 1.0, 3.0];
        let y = array![0.0, 2.0, 6.0];
        let linear = Interpolator::new(FitKind::Linear, x.clone(), y.clone()).unwrap();
        assert!(close(linear.eval(0.5).unwrap(), 1.0));
        assert!(close(linear.eval(2.0).unwrap(), 4.0));
        assert!(close(linear.eval(3.0).unwrap(), 6.0));

        let previous = Interpolator::new(FitKind::Previous, x.clone(), y.clone()).unwrap();
        assert_eq!(previous.eval(2.9).unwrap(), 2.0);
        assert_eq!(previous.eval(3.0).unwrap(), 6.0);

        let next = Interpolator::new(FitKind::Next, x.clone(), y.clone()).unwrap();
        assert_eq!(next.eval(1.5).unwrap(), 6.0);
        assert_eq!(next.eval(1.0).unwrap(), 2.0);

        let nearest = Interpolator::new(FitKind::Nearest, x, y).unwrap();
        assert_eq!(nearest.eval(1.9).unwrap(), 2.0);
        assert_eq!(nearest.eval(2.1).unwrap(), 6.0);
    }

    #[test]
    fn test_spline_reproduces_knots_and_lines() {
        let x = array![0.0, 1.0, 2.0, 3.0];
        let y = array![1.0, 3.0, 5.0, 7.0];
        let spline = Interpolator::new(FitKind::Spline, x, y).unwrap();
        assert!(close(spline.eval(1.0).unwrap(), 3.0));
        assert!(close(spline.eval(2.5).unwrap(), 6.0));

        let x = array![0.0, 1.0, 2.0];
        let y = array![0.0, 1.0, 0.0];
        let spline = Interpolator::new(FitKind::Spline, x, y).unwrap();
        // Natural spline through a peak: symmetric and above the chord
        let left = spline.eval(0.5).unwrap();
        let right = spline.eval(1.5).unwrap();
        assert!(close(left, right));
        assert!(left > 0.5);
    }

    #[test]
    fn test_out_of_range_is_error() {
        let fit = Interpolator::new(FitKind::Linear, array![0.0, 1.0], array![0.0, 1.0]).unwrap();
        assert!(matches!(fit.eval(1.5), Err(ScanError::Correction(_))));
        assert!(Interpolator::new(FitKind::Linear, array![1.0, 1.0], array![0.0, 1.0]).is_err());
    }

    #[test]
    fn test_table_parsing_sorts_rows() {
        let table = CorrectionTable::parse("# delay x y\n2 0.2 -0.2\n\n0 0.0 0.0\n1 0.1 -0.1\n").unwrap();
        assert_eq!(table.values.to_vec(), vec![0.0, 1.0, 2.0]);
        assert_eq!(table.second.to_vec(), vec![0.0, -0.1, -0.2]);
        assert!(CorrectionTable::parse("1 2\n").is_err());
        assert!(CorrectionTable::parse("1 a 3\n").is_err());
    }

    #[test]
    fn test_set_and_reset_relative() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cor.txt");
        std::fs::write(&path, "0 0 0\n10 1 -2\n").unwrap();

        let (sim, ctx) = sim_context();
        sim.set("TEST:SCANCOR:PVNAME1", "MIRR:X");
        sim.set("TEST:SCANCOR:PVNAME2", "MIRR:Y");
        sim.set("TEST:SCANCOR:PATH", path.to_str().unwrap());
        sim.set("TEST:SCANCOR:FITTYPE", "linear");
        sim.set("TEST:SCANCOR:PVSCALE1", 2.0);
        sim.set("TEST:SCANCOR:PVSCALE2", 1.0);
        sim.set("TEST:SCANCOR:CORRTYPE", 0);
        sim.set("MIRR:X", 100.0);
        sim.set("MIRR:Y", 50.0);

        let correction = ScanCorrection::from_config(&ctx).unwrap();
        correction.set(5.0).unwrap();
        assert_eq!(sim.value("MIRR:X").unwrap().as_f64(), Some(101.0));
        assert_eq!(sim.value("MIRR:Y").unwrap().as_f64(), Some(49.0));

        sim.set("TEST:SCANCOR:CORRTYPE", 1);
        correction.set(10.0).unwrap();
        assert_eq!(sim.value("MIRR:X").unwrap().as_f64(), Some(2.0));

        assert!(correction.set(11.0).is_err());
        correction.reset().unwrap();
        assert_eq!(sim.value("MIRR:X").unwrap().as_f64(), Some(100.0));
        assert_eq!(sim.value("MIRR:Y").unwrap().as_f64(), Some(50.0));
    }

    #[test]
    fn test_missing_path_is_error() {
        let (sim, ctx) = sim_context();
        sim.set("TEST:SCANCOR:PVNAME1", "MIRR:X");
        sim.set("TEST:SCANCOR:PVNAME2", "MIRR:Y");
        sim.set("MIRR:X", 0.0);
        sim.set("MIRR:Y", 0.0);
        assert!(matches!(
            ScanCorrection::from_config(&ctx),
            Err(ScanError::Correction(_))
        ));
    }
}
