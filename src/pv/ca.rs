use super::{ProcessVariables, PvValue};
use crate::error::ScanError;
use log::{debug, trace};
use std::process::Command;
use std::time::Duration;

/// Settings for the channel-access command-line backend.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use pvscan::pv::CaToolsConfig;
///
/// let config = CaToolsConfig {
///     timeout: Duration::from_secs(3),
///     ..Default::default()
/// };
/// assert_eq!(config.caget, "caget");
/// ```
#[derive(Debug, Clone)]
pub struct CaToolsConfig {
    /// Path or name of the `caget` executable
    pub caget: String,
    /// Path or name of the `caput` executable
    pub caput: String,
    /// Channel-access search/put timeout passed with `-w`
    pub timeout: Duration,
    /// `-w` for `caput -c`, which also bounds the wait for the completion
    /// callback (e.g. a file capture of many frames)
    pub callback_timeout: Duration,
}

impl Default for CaToolsConfig {
    fn default() -> Self {
        Self {
            caget: "caget".to_string(),
            caput: "caput".to_string(),
            timeout: Duration::from_secs(1),
            callback_timeout: Duration::from_secs(300),
        }
    }
}

/// Builder for [`CaToolsBackend`].
#[derive(Default)]
pub struct CaToolsBackendBuilder {
    config: CaToolsConfig,
}

impl CaToolsBackendBuilder {
    pub fn caget(mut self, path: &str) -> Self {
        self.config.caget = path.to_string();
        self
    }

    pub fn caput(mut self, path: &str) -> Self {
        self.config.caput = path.to_string();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn callback_timeout(mut self, timeout: Duration) -> Self {
        self.config.callback_timeout = timeout;
        self
    }

    pub fn config(mut self, config: CaToolsConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<CaToolsBackend, ScanError> {
        if self.config.caget.is_empty() || self.config.caput.is_empty() {
            return Err(ScanError::Config(
                "caget and caput executables must be specified".to_string(),
            ));
        }
        debug!(
            "Using channel access tools {} / {} (timeout {:?}, callback {:?})",
            self.config.caget, self.config.caput, self.config.timeout, self.config.callback_timeout
        );
        Ok(CaToolsBackend {
            config: self.config,
        })
    }
}

/// Channel-access backend that shells out to `caget`/`caput`.
///
/// Enum records are read as their index (`-n`), char-waveform strings with
/// `-S`. Strings carrying the trailing
/// null terminator are written with `caput -S`, which appends the terminator
/// itself, so the explicit `\0` is stripped before the call.
pub struct CaToolsBackend {
    config: CaToolsConfig,
}

impl CaToolsBackend {
    pub fn builder() -> CaToolsBackendBuilder {
        CaToolsBackendBuilder::default()
    }

    pub fn config(&self) -> &CaToolsConfig {
        &self.config
    }

    fn wait_arg(timeout: Duration) -> String {
        format!("{:.3}", timeout.as_secs_f64())
    }

    fn caget_args(&self, name: &str) -> Vec<String> {
        let wait = Self::wait_arg(self.config.timeout);
        ["-t", "-n", "-S", "-w", wait.as_str(), name]
            .map(str::to_string)
            .to_vec()
    }

    /// Arguments for `caput`; the value text has its `\0` terminator removed
    /// and `-S` added instead.
    fn caput_args(&self, name: &str, value: &PvValue, wait: bool) -> Vec<String> {
        let timeout = if wait {
            self.config.callback_timeout
        } else {
            self.config.timeout
        };
        let mut args = vec!["-t".to_string(), "-w".to_string(), Self::wait_arg(timeout)];
        if wait {
            args.push("-c".to_string());
        }
        let text = match value {
            PvValue::Str(s) if s.ends_with('\0') => {
                args.push("-S".to_string());
                s.trim_end_matches('\0').to_string()
            }
            other => other.to_string(),
        };
        args.push(name.to_string());
        args.push(text);
        args
    }

    fn caget(&self, name: &str) -> Option<String> {
        let output = Command::new(&self.config.caget)
            .args(self.caget_args(name))
            .output();

        match output {
            Ok(out) if out.status.success() => {
                let text = String::from_utf8_lossy(&out.stdout).trim().to_string();
                trace!("caget {} -> {:?}", name, text);
                Some(text)
            }
            Ok(out) => {
                debug!(
                    "caget {} failed: {}",
                    name,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                None
            }
            Err(e) => {
                debug!("Unable to run {}: {}", self.config.caget, e);
                None
            }
        }
    }
}

impl ProcessVariables for CaToolsBackend {
    fn connect(&self, name: &str) -> bool {
        self.caget(name).is_some()
    }

    fn get(&self, name: &str) -> Option<PvValue> {
        self.caget(name).map(|text| PvValue::parse(&text))
    }

    fn put(&self, name: &str, value: PvValue, wait: bool) -> Result<(), ScanError> {
        let args = self.caput_args(name, &value, wait);
        trace!("caput {}", args.join(" "));
        let out = Command::new(&self.config.caput).args(&args).output().map_err(|e| {
            ScanError::pv(name, format!("unable to run {}: {}", self.config.caput, e))
        })?;

        if out.status.success() {
            Ok(())
        } else {
            Err(ScanError::pv(
                name,
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_empty_tools() {
        assert!(CaToolsBackend::builder().caget("").build().is_err());
    }

    #[test]
    fn test_missing_tools_read_as_unreachable() {
        let backend = CaToolsBackend::builder()
            .caget("/nonexistent/caget")
            .caput("/nonexistent/caput")
            .timeout(Duration::from_millis(100))
            .build()
            .unwrap();

        assert!(!backend.connect("TEST:PV"));
        assert_eq!(backend.get("TEST:PV"), None);
        assert!(backend.put("TEST:PV", PvValue::Int(1), false).is_err());
    }

    #[test]
    fn test_callback_put_uses_callback_timeout() {
        let backend = CaToolsBackend::builder()
            .timeout(Duration::from_secs(1))
            .callback_timeout(Duration::from_secs(600))
            .build()
            .unwrap();

        assert_eq!(
            backend.caput_args("CAM1:TIFF1:Capture", &PvValue::Int(1), true),
            ["-t", "-w", "600.000", "-c", "CAM1:TIFF1:Capture", "1"]
        );
        assert_eq!(
            backend.caput_args("TEST:MSG", &PvValue::Str("Done\0".to_string()), false),
            ["-t", "-w", "1.000", "-S", "TEST:MSG", "Done"]
        );
    }

    /// A stand-in `caget` that, like the real tool, prints the state string
    /// of an enum record unless `-n` is given.
    #[cfg(unix)]
    fn enum_caget(dir: &std::path::Path) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("caget");
        std::fs::write(
            &path,
            "#!/bin/sh\nfor arg in \"$@\"; do\n  if [ \"$arg\" = \"-n\" ]; then echo 0; exit 0; fi\ndone\necho Disable\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    #[test]
    fn test_enum_flags_read_as_index() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CaToolsBackend::builder()
            .caget(&enum_caget(dir.path()))
            .build()
            .unwrap();

        let value = backend.get("SCAN:DATA:ENABLE").unwrap();
        assert_eq!(value, PvValue::Int(0));
        assert!(!value.is_truthy());
    }
}
