use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error ({context}): {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Invalid PV: {0}")]
    InvalidPv(String),
    #[error("PV access failed for {pv}: {reason}")]
    Pv { pv: String, reason: String },
    #[error("Shutter Error: {0}")]
    Shutter(String),
    #[error("Camera not acquiring: {0}")]
    CameraNotAcquiring(String),
    #[error("Filepath already exists: {}", .0.display())]
    FilepathExists(PathBuf),
    #[error("Scan correction error: {0}")]
    Correction(String),
    #[error("User script error: {0}")]
    UserScript(String),
    #[error("Signal error: {0}")]
    Signal(String),
    #[error("Scan interrupted")]
    Interrupted,
}

impl ScanError {
    pub fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        ScanError::Io {
            source,
            context: context.into(),
        }
    }

    pub fn pv(pv: impl Into<String>, reason: impl Into<String>) -> Self {
        ScanError::Pv {
            pv: pv.into(),
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for ScanError {
    fn from(e: config::ConfigError) -> Self {
        ScanError::Config(e.to_string())
    }
}
