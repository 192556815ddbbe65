//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `hwwwmon.toml`.
//!     loads configuration from file or falls back to defaults, then applies
//!     command line overrides on top.
//!
//! structure:
//!     - ServerConfig: listen address and port.
//!     - PollingConfig: sample cadence, read bound, history depth.
//!     - SessionConfig: admission policy and staleness timeout.
//!     - SensorsConfig: which sensor source, where hwmon lives.
//!     - LoggingConfig: log level, per-sample logging.
//!
//! ==============================================================================

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;

use crate::sensor::DEFAULT_HWMON_ROOT;
use crate::session::AdmissionPolicy;

/// Command line flags; anything given here beats the config file
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "hwwwmon", version, about = "Stream hwmon sensors to a browser")]
pub struct Args {
    /// IP address to listen on (default: 0.0.0.0)
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Port number to listen on (default: 8484)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Path to config file
    #[arg(short, long, env = "HWWWMON_CONFIG")]
    pub config: Option<PathBuf>,

    /// Sensor poll interval in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Use synthetic sensor data instead of /sys/class/hwmon
    #[arg(long)]
    pub mock: bool,
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub server: ServerConfig,
    pub polling: PollingConfig,
    pub session: SessionConfig,
    pub sensors: SensorsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
    /// upper bound on a single sensor read
    pub read_timeout_ms: u64,
    /// samples kept for /mon/history
    pub history: usize,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct SessionConfig {
    pub policy: AdmissionPolicy,
    /// 0 means five poll intervals
    pub stale_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Hwmon,
    Mock,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SensorsConfig {
    pub source: SourceKind,
    pub hwmon_root: PathBuf,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { listen: "0.0.0.0".to_string(), port: 8484 }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_ms: 1000, read_timeout_ms: 800, history: 120 }
    }
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self { source: SourceKind::Hwmon, hwmon_root: PathBuf::from(DEFAULT_HWMON_ROOT) }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: false }
    }
}

impl MonitorConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let config: MonitorConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Load with default fallback
    ///
    /// runs before logging is up, so it reports on stdout like the banner
    pub fn load_or_default() -> Self {
        let paths = [
            PathBuf::from("config").join("hwwwmon.toml"),
            PathBuf::from("..").join("config").join("hwwwmon.toml"),
        ];

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] No config file found - using defaults");
        Self::default()
    }

    /// Resolve the effective config: explicit --config must load, otherwise
    /// search the default locations; then apply flag overrides.
    pub fn from_args(args: &Args) -> anyhow::Result<Self> {
        let mut config = match &args.config {
            Some(path) => {
                let config = Self::load(path)?;
                println!("[CONFIG] Loaded from {}", path.display());
                config
            }
            None => Self::load_or_default(),
        };
        config.apply_args(args);
        Ok(config)
    }

    pub fn apply_args(&mut self, args: &Args) {
        if let Some(listen) = &args.listen {
            self.server.listen = listen.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }
        if let Some(ms) = args.interval_ms {
            self.polling.interval_ms = ms;
        }
        if args.mock {
            self.sensors.source = SourceKind::Mock;
        }
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.server.listen, self.server.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid listen address {}:{}: {}", self.server.listen, self.server.port, e))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.polling.read_timeout_ms.max(1))
    }

    pub fn stale_timeout(&self) -> Duration {
        match self.session.stale_timeout_ms {
            0 => self.poll_interval() * 5,
            ms => Duration::from_millis(ms),
        }
    }

    /// how often an idle stream is touched; at most half the stale timeout
    /// so a healthy client is never reaped between two touches
    pub fn keepalive(&self) -> Duration {
        self.poll_interval().min(self.stale_timeout() / 2).max(Duration::from_millis(1))
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│           MONITOR CONFIGURATION         │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Listen: {}:{}", self.server.listen, self.server.port);
        println!("│ Source: {:?}", self.sensors.source);
        println!("│ Poll Interval: {}ms", self.polling.interval_ms);
        println!("│ Stale Timeout: {}ms", self.stale_timeout().as_millis());
        println!("│ Keepalive: {}ms", self.keepalive().as_millis());
        println!("│ Session Policy: {:?}", self.session.policy);
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}
