//! Parallel-connection throughput measurement.
//!
//! The engine runs `connections` concurrent transfers of one payload, samples
//! the shared byte counter on a fixed tick, and derives instantaneous,
//! average and peak speeds plus a stability score from the samples.
//!
//! A connection that fails just stops contributing bytes. Only when every
//! connection fails does the measurement fail.

use crate::config::Config;
use crate::latency::Sample;
use crate::payload::{default_bucket, select_bucket, PayloadBucket, PROBE_PAYLOAD_BYTES};
use crate::progress::{notify, CallbackRef, ProgressCallback, ProgressEvent, TestPhase};
use crate::stats;
use crate::transport::{ByteCounter, Transport};
use crate::{Error, Result};
use futures::future::BoxFuture;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Upper bound on the payload-sizing probe.
pub const MAX_PROBE_DURATION: Duration = Duration::from_secs(2);

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub fn phase(&self) -> TestPhase {
        match self {
            Direction::Download => TestPhase::Download,
            Direction::Upload => TestPhase::Upload,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => f.write_str("download"),
            Direction::Upload => f.write_str("upload"),
        }
    }
}

/// Parameters of one throughput measurement.
#[derive(Debug, Clone)]
pub struct ThroughputConfig {
    pub duration: Duration,
    pub connections: usize,
    pub overhead_compensation: f64,
    pub progress_interval: Duration,
    /// Run a short single-connection probe to pick the payload bucket
    pub probe: bool,
    pub probe_duration: Duration,
    /// Number of per-tick deltas averaged into the instantaneous speed
    pub smoothing_window: usize,
    pub simulated_fallback: bool,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            connections: 4,
            overhead_compensation: 0.04,
            progress_interval: Duration::from_millis(200),
            probe: true,
            probe_duration: MAX_PROBE_DURATION,
            smoothing_window: 3,
            simulated_fallback: false,
        }
    }
}

impl ThroughputConfig {
    /// Parameters for a full one-shot test phase.
    pub fn from_config(config: &Config) -> Self {
        Self {
            duration: config.transfer_duration,
            connections: config.parallel_connections,
            overhead_compensation: config.overhead_compensation,
            progress_interval: config.progress_interval,
            probe: config.probe_payload,
            simulated_fallback: config.simulated_fallback,
            ..Default::default()
        }
    }

    /// Shorter, probe-less parameters for monitoring refreshes.
    pub fn for_monitoring(config: &Config) -> Self {
        Self {
            duration: config.monitoring_transfer_duration,
            probe: false,
            ..Self::from_config(config)
        }
    }

    /// Longest this measurement may take before it has to have settled,
    /// excluding any grace period.
    pub fn max_duration(&self) -> Duration {
        let probe = if self.probe {
            self.probe_duration.min(MAX_PROBE_DURATION)
        } else {
            Duration::ZERO
        };
        probe + self.duration
    }

    fn compensation_factor(&self) -> f64 {
        1.0 + self.overhead_compensation
    }
}

/// Outcome of one direction of a throughput test. Speeds in Mbps, overhead
/// compensation already applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputResult {
    pub direction: Direction,
    pub speed_mbps: f64,
    pub bytes_transferred: u64,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub connection_count: usize,
    pub failed_connections: usize,
    pub speed_history: Vec<Sample>,
    pub peak_speed_mbps: f64,
    pub avg_speed_mbps: f64,
    /// 0–100, 100 meaning perfectly constant speed
    pub stability: f64,
    pub payload: String,
    /// Set when the numbers were synthesized instead of measured
    pub simulated: bool,
}

/// Stability score from the coefficient of variation of speed samples.
///
/// Fewer than two samples, or identical samples, score 100.
pub fn stability(history: &[f64]) -> f64 {
    if history.len() < 2 {
        return 100.0;
    }
    let mean = stats::mean(history);
    let sd = stats::stdev(history);
    if sd == 0.0 || mean <= 0.0 {
        return if sd == 0.0 { 100.0 } else { 0.0 };
    }
    (100.0 * (1.0 - sd / mean)).clamp(0.0, 100.0)
}

/// Runs download and upload measurements against one transport.
///
/// # Examples
///
/// ```no_run
/// use netpulse::throughput::{ThroughputConfig, ThroughputEngine};
/// use netpulse::transport::HttpTransport;
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(HttpTransport::new("https://speed.cloudflare.com")?);
/// let engine = ThroughputEngine::new(transport).with_callback(|event: netpulse::ProgressEvent| {
///     if let Some(speed) = event.speed_mbps {
///         println!("{:.1} Mbps", speed);
///     }
/// });
///
/// let result = engine.measure_download(&ThroughputConfig::default()).await?;
/// println!("peak {:.1} Mbps, stability {:.0}", result.peak_speed_mbps, result.stability);
/// # Ok(())
/// # }
/// ```
pub struct ThroughputEngine {
    transport: Arc<dyn Transport>,
    callback: Option<CallbackRef>,
    cancellation_token: CancellationToken,
}

impl ThroughputEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            callback: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub(crate) fn with_callback_ref(mut self, callback: Option<CallbackRef>) -> Self {
        self.callback = callback;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    pub async fn measure_download(&self, config: &ThroughputConfig) -> Result<ThroughputResult> {
        self.measure(Direction::Download, config).await
    }

    pub async fn measure_upload(&self, config: &ThroughputConfig) -> Result<ThroughputResult> {
        self.measure(Direction::Upload, config).await
    }

    /// Measures one direction.
    ///
    /// # Errors
    ///
    /// [`Error::Transfer`] when every connection failed (unless the simulated
    /// fallback is enabled), [`Error::Cancelled`] when the token fires, and
    /// [`Error::Config`] for zero connections or a zero tick.
    pub async fn measure(
        &self,
        direction: Direction,
        config: &ThroughputConfig,
    ) -> Result<ThroughputResult> {
        if config.connections == 0 {
            return Err(Error::Config("at least one connection is required".to_string()));
        }
        if config.progress_interval.is_zero() {
            return Err(Error::Config("progress interval must be non-zero".to_string()));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let bucket = if config.probe {
            match self.probe(direction, config).await {
                Ok(estimate) => {
                    let bucket = select_bucket(estimate);
                    debug!(
                        "{} probe estimate {:.2} Mbps, using {} payload",
                        direction, estimate, bucket.name
                    );
                    bucket
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    debug!("{} probe failed ({}), using default payload", direction, e);
                    default_bucket()
                }
            }
        } else {
            default_bucket()
        };

        info!(
            "Starting {} test: {} connections, {} payload ({} bytes each) against {}",
            direction,
            config.connections,
            bucket.name,
            bucket.size_bytes,
            self.transport.endpoint()
        );

        self.run_transfers(direction, bucket, config).await
    }

    fn transfer(
        &self,
        direction: Direction,
        bytes: u64,
        counter: ByteCounter,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<u64>> {
        match direction {
            Direction::Download => self.transport.download(bytes, counter, cancel),
            Direction::Upload => self.transport.upload(bytes, counter, cancel),
        }
    }

    /// Single-connection transfer bounded by the probe duration; returns the
    /// observed speed in Mbps.
    async fn probe(&self, direction: Direction, config: &ThroughputConfig) -> Result<f64> {
        let limit = config.probe_duration.min(MAX_PROBE_DURATION);
        let counter = ByteCounter::new();
        let cancel = self.cancellation_token.child_token();
        let start = Instant::now();

        let outcome = tokio::select! {
            _ = self.cancellation_token.cancelled() => return Err(Error::Cancelled),
            outcome = time::timeout(
                limit,
                self.transfer(direction, PROBE_PAYLOAD_BYTES, counter.clone(), cancel.clone()),
            ) => outcome,
        };
        cancel.cancel();

        if let Ok(Err(e)) = outcome {
            if counter.get() == 0 {
                return Err(e);
            }
        }
        Ok(stats::to_mbps(counter.get(), start.elapsed().as_secs_f64()))
    }

    async fn run_transfers(
        &self,
        direction: Direction,
        bucket: PayloadBucket,
        config: &ThroughputConfig,
    ) -> Result<ThroughputResult> {
        let counter = ByteCounter::new();
        let connection_cancel = self.cancellation_token.child_token();
        let factor = config.compensation_factor();

        let mut connections = JoinSet::new();
        for id in 0..config.connections {
            let transport = self.transport.clone();
            let counter = counter.clone();
            let cancel = connection_cancel.clone();
            let size = bucket.size_bytes;
            connections.spawn(async move {
                let outcome = match direction {
                    Direction::Download => transport.download(size, counter, cancel).await,
                    Direction::Upload => transport.upload(size, counter, cancel).await,
                };
                (id, outcome)
            });
        }

        let start = Instant::now();
        let deadline = time::sleep_until(start + config.duration);
        tokio::pin!(deadline);
        let mut ticker = time::interval_at(start + config.progress_interval, config.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let window_len = config.smoothing_window.max(1);
        let mut window: VecDeque<f64> = VecDeque::with_capacity(window_len);
        let mut history: Vec<Sample> = Vec::new();
        let mut last_bytes = 0u64;
        let mut last_tick = start;
        let mut failed = 0usize;
        let mut cancelled = false;

        while !connections.is_empty() {
            tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = &mut deadline => break,
                joined = connections.join_next() => match joined {
                    Some(Ok((id, Ok(bytes)))) => {
                        debug!("{} connection {} finished after {} bytes", direction, id, bytes);
                    }
                    Some(Ok((id, Err(e)))) => {
                        failed += 1;
                        warn!("{} connection {} failed: {}", direction, id, e);
                    }
                    Some(Err(e)) => {
                        failed += 1;
                        warn!("{} connection task ended abnormally: {}", direction, e);
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    let now = Instant::now();
                    let total = counter.get();
                    let instantaneous = stats::to_mbps(
                        total.saturating_sub(last_bytes),
                        (now - last_tick).as_secs_f64(),
                    );
                    last_bytes = total;
                    last_tick = now;

                    if window.len() == window_len {
                        window.pop_front();
                    }
                    window.push_back(instantaneous);
                    let smoothed = stats::mean(window.make_contiguous()) * factor;
                    history.push(Sample::now(smoothed));

                    let percentage = ((now - start).as_secs_f64()
                        / config.duration.as_secs_f64()
                        * 100.0)
                        .min(100.0);
                    notify(
                        &self.callback,
                        ProgressEvent::new(direction.phase(), percentage).with_speed(smoothed),
                    );
                }
            }
        }

        connection_cancel.cancel();
        let elapsed = start.elapsed();
        let total = counter.get();
        connections.shutdown().await;

        if cancelled {
            info!("{} test cancelled", direction);
            return Err(Error::Cancelled);
        }

        if failed == config.connections {
            if config.simulated_fallback {
                return Ok(simulated_result(direction, bucket, config));
            }
            return Err(Error::Transfer(format!(
                "all {} {} connections failed",
                config.connections, direction
            )));
        }

        let values: Vec<f64> = history.iter().map(|s| s.value).collect();
        let avg = stats::to_mbps(total, elapsed.as_secs_f64()) * factor;
        let peak = if values.is_empty() { avg } else { stats::max(&values) };

        let result = ThroughputResult {
            direction,
            speed_mbps: avg,
            bytes_transferred: total,
            duration: elapsed,
            connection_count: config.connections,
            failed_connections: failed,
            peak_speed_mbps: peak,
            avg_speed_mbps: avg,
            stability: stability(&values),
            speed_history: history,
            payload: bucket.name.to_string(),
            simulated: false,
        };

        info!(
            "{} result: {:.2} Mbps avg, {:.2} Mbps peak, stability {:.0}, {} bytes in {:.2}s",
            direction,
            result.avg_speed_mbps,
            result.peak_speed_mbps,
            result.stability,
            result.bytes_transferred,
            elapsed.as_secs_f64()
        );
        Ok(result)
    }
}

/// Synthetic result standing in for a transfer that never happened: every
/// connection is assumed to have moved its full payload over the configured
/// duration.
fn simulated_result(
    direction: Direction,
    bucket: PayloadBucket,
    config: &ThroughputConfig,
) -> ThroughputResult {
    warn!(
        "All {} {} connections failed; reporting a simulated result",
        config.connections, direction
    );
    let bytes = bucket.size_bytes * config.connections as u64;
    let speed = stats::to_mbps(bytes, config.duration.as_secs_f64()) * config.compensation_factor();
    ThroughputResult {
        direction,
        speed_mbps: speed,
        bytes_transferred: bytes,
        duration: config.duration,
        connection_count: config.connections,
        failed_connections: config.connections,
        speed_history: Vec::new(),
        peak_speed_mbps: speed,
        avg_speed_mbps: speed,
        stability: 100.0,
        payload: bucket.name.to_string(),
        simulated: true,
    }
}
