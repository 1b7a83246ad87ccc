use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dissect::{DEFAULT_KEYLOG_ENV, DEFAULT_TIMEOUT};
use crate::error::ConfigError;
use crate::flow::DEFAULT_FLOW_CAPACITY;
use crate::network::{DEFAULT_QUEUE_CAPACITY, DEFAULT_RING_CAPACITY};
use crate::process::DEFAULT_REFRESH_INTERVAL;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub dissector: DissectorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Device handed to dumpcap; `any` captures every interface.
    pub interface: String,
    /// BPF expression passed to `dumpcap -f`.
    pub bpf_filter: Option<String>,
    pub dumpcap: PathBuf,
    pub queue_capacity: usize,
    pub flow_capacity: usize,
    pub ring_capacity: usize,
    pub correlate_processes: bool,
    pub process_refresh_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            interface: "any".to_owned(),
            bpf_filter: None,
            dumpcap: PathBuf::from("dumpcap"),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            flow_capacity: DEFAULT_FLOW_CAPACITY,
            ring_capacity: DEFAULT_RING_CAPACITY,
            correlate_processes: true,
            process_refresh_ms: DEFAULT_REFRESH_INTERVAL.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DissectorConfig {
    pub tshark: PathBuf,
    pub editcap: PathBuf,
    pub timeout_secs: u64,
    /// Environment variable naming the TLS key-log file.
    pub keylog_env: String,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for DissectorConfig {
    fn default() -> Self {
        DissectorConfig {
            tshark: PathBuf::from("tshark"),
            editcap: PathBuf::from("editcap"),
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            keylog_env: DEFAULT_KEYLOG_ENV.to_owned(),
            scratch_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_owned(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Loads `path`, falling back to defaults when it is missing or invalid.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!(
                event.name = "config.fallback",
                path = %path.display(),
                error = %e,
                "could not load config, using defaults"
            );
            Config::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_files_keep_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "capture:\n  interface: eth0\n  bpf_filter: \"port 443\"\ndissector:\n  timeout_secs: 5\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.capture.interface, "eth0");
        assert_eq!(config.capture.bpf_filter.as_deref(), Some("port 443"));
        assert_eq!(config.capture.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(config.dissector.timeout_secs, 5);
        assert_eq!(config.dissector.keylog_env, "SSLKEYLOGFILE");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn missing_or_invalid_files_fall_back() {
        let config = Config::load_or_default(Path::new("/nonexistent/vshark.yaml"));
        assert_eq!(config, Config::default());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "capture: [not, a, map]").unwrap();
        assert!(matches!(Config::load(file.path()), Err(ConfigError::Yaml(_))));
        assert_eq!(Config::load_or_default(file.path()), Config::default());
    }
}
