use crate::endpoint::TestServer;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default measurement endpoint (download/upload/latency routes).
pub const DEFAULT_SERVER_URL: &str = "https://speed.cloudflare.com";

/// Connection class reported by the host platform.
///
/// Used only by the heuristic latency probe, the last strategy of the
/// fallback chain, when every real measurement has failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionClass {
    Ethernet,
    Wifi,
    Cellular5g,
    Cellular4g,
    Cellular3g,
    Cellular2g,
    SlowCellular2g,
}

impl ConnectionClass {
    /// Typical round-trip time for this class of link, in milliseconds.
    pub fn typical_rtt_ms(&self) -> f64 {
        match self {
            ConnectionClass::Ethernet => 10.0,
            ConnectionClass::Wifi => 25.0,
            ConnectionClass::Cellular5g => 30.0,
            ConnectionClass::Cellular4g => 60.0,
            ConnectionClass::Cellular3g => 150.0,
            ConnectionClass::Cellular2g => 400.0,
            ConnectionClass::SlowCellular2g => 1_000.0,
        }
    }
}

/// Configuration for a one-shot test and for monitoring sessions.
///
/// Use the builder methods to customize a default configuration, or load a
/// JSON file where durations are written in humantime form (`"10s"`,
/// `"250ms"`).
///
/// # Examples
///
/// ```
/// use netpulse::Config;
/// use std::time::Duration;
///
/// let config = Config::new()
///     .with_parallel_connections(6)
///     .with_transfer_duration(Duration::from_secs(15))
///     .with_latency_sample_count(20);
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the measurement endpoint
    pub server_url: String,

    /// Candidate endpoints; when non-empty the best one is selected per run
    pub candidate_servers: Vec<TestServer>,

    /// Number of latency attempts in a series
    pub latency_sample_count: usize,

    /// Per-attempt latency timeout
    #[serde(with = "humantime_serde")]
    pub latency_timeout: Duration,

    /// Pause between latency attempts
    #[serde(with = "humantime_serde")]
    pub latency_interval: Duration,

    /// Number of concurrent transfers per direction
    pub parallel_connections: usize,

    /// Length of each throughput phase
    #[serde(with = "humantime_serde")]
    pub transfer_duration: Duration,

    /// Fractional upward adjustment for protocol overhead (0.04 = +4%)
    pub overhead_compensation: f64,

    /// Throughput sampling / progress tick
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,

    /// Monitoring tick period
    #[serde(with = "humantime_serde")]
    pub monitoring_interval: Duration,

    /// Ring buffer capacity of a monitoring session
    pub max_data_points: usize,

    /// How often monitoring runs the full throughput engine
    #[serde(with = "humantime_serde")]
    pub throughput_refresh_interval: Duration,

    /// Transfer length used by monitoring throughput refreshes
    #[serde(with = "humantime_serde")]
    pub monitoring_transfer_duration: Duration,

    /// Run a short single-connection probe to choose the payload size
    pub probe_payload: bool,

    /// Substitute a synthetic transfer when every connection fails
    pub simulated_fallback: bool,

    /// Slack added to every phase's computed maximum duration
    #[serde(with = "humantime_serde")]
    pub phase_grace: Duration,

    /// Link class hint for the heuristic latency estimate
    pub connection_class: Option<ConnectionClass>,

    /// Number of past results kept in the history
    pub history_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            candidate_servers: Vec::new(),
            latency_sample_count: 10,
            latency_timeout: Duration::from_secs(3),
            latency_interval: Duration::from_millis(200),
            parallel_connections: 4,
            transfer_duration: Duration::from_secs(10),
            overhead_compensation: 0.04,
            progress_interval: Duration::from_millis(200),
            monitoring_interval: Duration::from_secs(2),
            max_data_points: 150,
            throughput_refresh_interval: Duration::from_secs(30),
            monitoring_transfer_duration: Duration::from_secs(3),
            probe_payload: true,
            simulated_fallback: false,
            phase_grace: Duration::from_secs(5),
            connection_class: None,
            history_limit: 50,
        }
    }
}

impl Config {
    /// Creates a configuration with default values.
    ///
    /// ```
    /// use netpulse::Config;
    ///
    /// let config = Config::new();
    /// assert_eq!(config.parallel_connections, 4);
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.latency_sample_count == 0 {
            return Err(Error::Config(
                "latency_sample_count must be at least 1".to_string(),
            ));
        }
        if self.parallel_connections == 0 {
            return Err(Error::Config(
                "parallel_connections must be at least 1".to_string(),
            ));
        }
        if self.max_data_points == 0 {
            return Err(Error::Config(
                "max_data_points must be at least 1".to_string(),
            ));
        }
        if !self.overhead_compensation.is_finite() || self.overhead_compensation < 0.0 {
            return Err(Error::Config(format!(
                "overhead_compensation must be a non-negative number, got {}",
                self.overhead_compensation
            )));
        }
        let durations = [
            ("latency_timeout", self.latency_timeout),
            ("transfer_duration", self.transfer_duration),
            ("progress_interval", self.progress_interval),
            ("monitoring_interval", self.monitoring_interval),
            ("throughput_refresh_interval", self.throughput_refresh_interval),
            ("monitoring_transfer_duration", self.monitoring_transfer_duration),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = url.into();
        self
    }

    /// Sets the candidate endpoints the orchestrator selects from.
    pub fn with_candidate_servers(mut self, servers: Vec<TestServer>) -> Self {
        self.candidate_servers = servers;
        self
    }

    pub fn with_latency_sample_count(mut self, count: usize) -> Self {
        self.latency_sample_count = count;
        self
    }

    pub fn with_latency_timeout(mut self, timeout: Duration) -> Self {
        self.latency_timeout = timeout;
        self
    }

    pub fn with_latency_interval(mut self, interval: Duration) -> Self {
        self.latency_interval = interval;
        self
    }

    /// Sets the number of concurrent transfers per direction.
    pub fn with_parallel_connections(mut self, connections: usize) -> Self {
        self.parallel_connections = connections;
        self
    }

    pub fn with_transfer_duration(mut self, duration: Duration) -> Self {
        self.transfer_duration = duration;
        self
    }

    /// Sets the overhead compensation factor applied to reported speeds.
    ///
    /// ```
    /// use netpulse::Config;
    ///
    /// let config = Config::new().with_overhead_compensation(0.0);
    /// assert_eq!(config.overhead_compensation, 0.0);
    /// ```
    pub fn with_overhead_compensation(mut self, factor: f64) -> Self {
        self.overhead_compensation = factor;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_monitoring_interval(mut self, interval: Duration) -> Self {
        self.monitoring_interval = interval;
        self
    }

    pub fn with_max_data_points(mut self, max: usize) -> Self {
        self.max_data_points = max;
        self
    }

    pub fn with_throughput_refresh_interval(mut self, interval: Duration) -> Self {
        self.throughput_refresh_interval = interval;
        self
    }

    pub fn with_monitoring_transfer_duration(mut self, duration: Duration) -> Self {
        self.monitoring_transfer_duration = duration;
        self
    }

    pub fn with_probe_payload(mut self, probe: bool) -> Self {
        self.probe_payload = probe;
        self
    }

    /// Opts in to synthetic results when every transfer connection fails.
    ///
    /// Off by default: a run where nothing could be transferred reports a
    /// transfer error instead of a fabricated speed.
    pub fn with_simulated_fallback(mut self, enabled: bool) -> Self {
        self.simulated_fallback = enabled;
        self
    }

    pub fn with_phase_grace(mut self, grace: Duration) -> Self {
        self.phase_grace = grace;
        self
    }

    pub fn with_connection_class(mut self, class: ConnectionClass) -> Self {
        self.connection_class = Some(class);
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }
}
