use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::capture::control::{DEFAULT_EVENT_SELECTS, DEFAULT_PERIOD, MIN_PERIOD, NUM_EVENT_SELECTS};
use crate::capture::pool::DEFAULT_POOL_SIZE;
use crate::identity::{DEFAULT_CHECKS, DEFAULT_PROC_ROOT, DEFAULT_TEMPLATE_NAME};
use crate::sender::{
    DEFAULT_CONTROL_DIR, DEFAULT_DEVICE_PATH, DEFAULT_MISSED_PATH, DEFAULT_WARMUP_BUFFERS,
};

/// Top-level configuration for pmusync.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Sample capture configuration.
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Process identity cache configuration.
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Sender session configuration.
    #[serde(default)]
    pub sender: SenderConfig,

    /// Reader (split/dump) configuration.
    #[serde(default)]
    pub reader: ReaderConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Sample capture configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Buffers allocated for the pool. Default: 8.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Counter overflow period in cycles. Default: 1000000.
    #[serde(default = "default_period")]
    pub period: u32,

    /// Smallest accepted period. Default: 10000.
    #[serde(default = "default_min_period")]
    pub min_period: u32,

    /// Event selector values, at most four. Default: [0x8, 0, 0, 0].
    #[serde(default = "default_counter_events")]
    pub counter_events: Vec<u32>,

    /// Cores to simulate. Default: 4.
    #[serde(default = "default_cores")]
    pub cores: usize,

    /// Interval between simulated overflows on each core. Default: 1ms.
    #[serde(default = "default_tick", with = "humantime_serde")]
    pub tick: Duration,

    /// Pids the simulated cores rotate through. Default: this process.
    #[serde(default)]
    pub simulated_pids: Vec<u32>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            period: default_period(),
            min_period: default_min_period(),
            counter_events: default_counter_events(),
            cores: default_cores(),
            tick: default_tick(),
            simulated_pids: Vec::new(),
        }
    }
}

/// Process identity cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    /// procfs mount point. Default: "/proc".
    #[serde(default = "default_proc_root")]
    pub proc_root: PathBuf,

    /// Command line of the process that forks application processes.
    /// Default: "zygote".
    #[serde(default = "default_template_name")]
    pub template_name: String,

    /// Re-validation budget per pid. Default: 10.
    #[serde(default = "default_checks")]
    pub checks: u32,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            proc_root: default_proc_root(),
            template_name: default_template_name(),
            checks: default_checks(),
        }
    }
}

/// Sender session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SenderConfig {
    /// Collector address as host:port. Exclusive with `output`.
    #[serde(default)]
    pub endpoint: String,

    /// Capture file to write instead of a collector.
    #[serde(default)]
    pub output: String,

    /// Mirror every byte sent into this file.
    #[serde(default)]
    pub debug_mirror: String,

    /// Stop once more than this many kilobytes (1000 bytes) were sent.
    /// 0 = unlimited.
    #[serde(default)]
    pub kbytes_limit: u64,

    /// Buffers discarded before the missed baseline. Default: 2.
    #[serde(default = "default_warmup_buffers")]
    pub warmup_buffers: usize,

    /// Capture device to read buffer records from.
    #[serde(default = "default_device_path")]
    pub device: PathBuf,

    /// Driver control directory. `send` reads `period` and the event
    /// selects `0`..`3` from here for the session description.
    #[serde(default = "default_control_dir")]
    pub control_dir: PathBuf,

    /// Control file holding the missed-sample counter.
    #[serde(default = "default_missed_path")]
    pub missed_path: PathBuf,

    /// Buffers queued between the reader thread and the encoder. Default: 4.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            output: String::new(),
            debug_mirror: String::new(),
            kbytes_limit: 0,
            warmup_buffers: default_warmup_buffers(),
            device: default_device_path(),
            control_dir: default_control_dir(),
            missed_path: default_missed_path(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Trace file format produced by `split`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Comma-separated rows.
    Text,
    /// Little-endian 32-bit words.
    #[default]
    Binary,
}

/// Reader configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReaderConfig {
    /// Directory `split` writes into.
    #[serde(default)]
    pub output_dir: String,

    /// Trace file format. Default: binary.
    #[serde(default)]
    pub format: OutputFormat,

    /// Packets for cores at or above this are dropped. Default: 16.
    #[serde(default = "default_max_cores")]
    pub max_cores: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            output_dir: String::new(),
            format: OutputFormat::default(),
            max_cores: default_max_cores(),
        }
    }
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    /// Listen address (e.g. ":9090"). Empty disables the server.
    #[serde(default)]
    pub addr: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_period() -> u32 {
    DEFAULT_PERIOD
}

fn default_min_period() -> u32 {
    MIN_PERIOD
}

fn default_counter_events() -> Vec<u32> {
    DEFAULT_EVENT_SELECTS.to_vec()
}

fn default_cores() -> usize {
    4
}

fn default_tick() -> Duration {
    Duration::from_millis(1)
}

fn default_proc_root() -> PathBuf {
    PathBuf::from(DEFAULT_PROC_ROOT)
}

fn default_template_name() -> String {
    DEFAULT_TEMPLATE_NAME.to_string()
}

fn default_checks() -> u32 {
    DEFAULT_CHECKS
}

fn default_warmup_buffers() -> usize {
    DEFAULT_WARMUP_BUFFERS
}

fn default_device_path() -> PathBuf {
    PathBuf::from(DEFAULT_DEVICE_PATH)
}

fn default_control_dir() -> PathBuf {
    PathBuf::from(DEFAULT_CONTROL_DIR)
}

fn default_missed_path() -> PathBuf {
    PathBuf::from(DEFAULT_MISSED_PATH)
}

fn default_queue_depth() -> usize {
    4
}

fn default_max_cores() -> usize {
    16
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            capture: CaptureConfig::default(),
            identity: IdentityConfig::default(),
            sender: SenderConfig::default(),
            reader: ReaderConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.capture.pool_size == 0 {
            bail!("capture.pool_size must be positive");
        }

        if self.capture.min_period == 0 {
            bail!("capture.min_period must be positive");
        }

        if self.capture.counter_events.len() > NUM_EVENT_SELECTS {
            bail!(
                "capture.counter_events has {} entries, at most {NUM_EVENT_SELECTS} supported",
                self.capture.counter_events.len()
            );
        }

        if self.capture.cores == 0 || self.capture.cores > usize::from(u8::MAX) + 1 {
            bail!("capture.cores must be between 1 and 256");
        }

        if self.capture.tick.is_zero() {
            bail!("capture.tick must be positive");
        }

        if self.identity.template_name.is_empty() {
            bail!("identity.template_name must not be empty");
        }

        if !self.sender.endpoint.is_empty() && !self.sender.output.is_empty() {
            bail!("sender.endpoint and sender.output are mutually exclusive");
        }

        if self.sender.queue_depth == 0 {
            bail!("sender.queue_depth must be positive");
        }

        if self.reader.max_cores == 0 || self.reader.max_cores > usize::from(u8::MAX) + 1 {
            bail!("reader.max_cores must be between 1 and 256");
        }

        Ok(())
    }

    /// Effective overflow period: the configured period raised to the minimum.
    pub fn effective_period(&self) -> u32 {
        self.capture.period.max(self.capture.min_period)
    }

}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.capture.pool_size, 8);
        assert_eq!(cfg.capture.period, 1_000_000);
        assert_eq!(cfg.capture.counter_events, vec![0x8, 0, 0, 0]);
        assert_eq!(cfg.identity.template_name, "zygote");
        assert_eq!(cfg.identity.checks, 10);
        assert_eq!(cfg.sender.warmup_buffers, 2);
        assert_eq!(cfg.reader.max_cores, 16);
        assert_eq!(cfg.reader.format, OutputFormat::Binary);
        assert!(cfg.health.addr.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
log_level: debug
capture:
  pool_size: 16
  period: 5000
  counter_events: [8, 16]
  tick: 250us
identity:
  template_name: spawner
sender:
  endpoint: "127.0.0.1:9000"
  kbytes_limit: 64
reader:
  format: text
  max_cores: 8
health:
  addr: ":9191"
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();

        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.capture.pool_size, 16);
        assert_eq!(cfg.capture.tick, Duration::from_micros(250));
        assert_eq!(cfg.effective_period(), MIN_PERIOD);
        assert_eq!(cfg.identity.template_name, "spawner");
        assert_eq!(cfg.identity.checks, 10);
        assert_eq!(cfg.sender.kbytes_limit, 64);
        assert_eq!(cfg.sender.control_dir, PathBuf::from("/sys/sync_pmu"));
        assert_eq!(cfg.reader.format, OutputFormat::Text);
        assert_eq!(cfg.health.addr, ":9191");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.capture.pool_size = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.capture.counter_events = vec![1, 2, 3, 4, 5];
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.sender.endpoint = "host:1".to_string();
        cfg.sender.output = "out.bin".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.reader.max_cores = 300;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pmusync.yaml");
        std::fs::write(&path, "capture:\n  pool_size: 0\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("pool_size"));
    }
}
