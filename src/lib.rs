pub mod abort;
pub mod app;
pub mod config;
pub mod context;
pub mod correction;
pub mod data_logger;
pub mod device;
pub mod error;
pub mod experiment;
pub mod grabber;
pub mod plotting;
pub mod pv;
pub mod runner;
pub mod scan;
pub mod shutter;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use abort::{AbortController, AbortReport, ProcessKiller, SignalKiller};
pub use config::{load_config, AppConfig, BackendKind};
pub use context::{Console, ScanContext, StatusChannel, Timing};
pub use correction::{CorrectionTable, FitKind, ScanCorrection};
pub use data_logger::{DataLogger, DataLoggerHandle, LoggerSettings};
pub use device::{DeviceHandles, DeviceKind, Movable, ScanDevice};
pub use error::ScanError;
pub use experiment::{Experiment, OutputFlags};
pub use grabber::{AreaDetectorGrabber, CaptureMode, DirectDetectorGrabber, GrabSettings, ImageGrabber};
pub use pv::{CaToolsBackend, Pv, PvValue, ProcessVariables, SimulatedPvs};
pub use runner::{CommandLauncher, MultiRunner, RunPlan, RunReport, ScanLauncher};
pub use scan::{Acquisition, ScanDriver, ScanMode, ScanOptions};
pub use shutter::{Shutter, ShutterGroup, ShutterKind, ShutterState};
pub use utils::{poll_until, PollError};
