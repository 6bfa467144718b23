//! Round-trip latency measurement with a fallback chain of probing
//! strategies.
//!
//! A single sample walks the strategy list in order and takes the first one
//! that answers within the timeout. Callers only ever see the aggregate
//! outcome: a latency, or a connectivity error once the whole chain failed.

use crate::config::{Config, ConnectionClass};
use crate::progress::{notify, CallbackRef, ProgressCallback, ProgressEvent, TestPhase};
use crate::stats;
use crate::transport::Transport;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// A timestamped measurement value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn now(value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            value,
        }
    }
}

/// One latency measurement strategy.
///
/// Strategies are interchangeable: each either produces a round-trip time in
/// milliseconds or fails.
pub trait LatencyProbe: Send + Sync {
    fn name(&self) -> &'static str;

    fn attempt<'a>(
        &'a self,
        transport: &'a dyn Transport,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<f64>>;
}

/// Times a minimal request/response exchange.
pub struct RequestProbe;

impl LatencyProbe for RequestProbe {
    fn name(&self) -> &'static str {
        "request"
    }

    fn attempt<'a>(
        &'a self,
        transport: &'a dyn Transport,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<f64>> {
        Box::pin(async move {
            let rtt = transport.request_rtt(timeout).await?;
            Ok(rtt.as_secs_f64() * 1000.0)
        })
    }
}

/// Times loading a tiny resource.
pub struct ResourceLoadProbe;

impl LatencyProbe for ResourceLoadProbe {
    fn name(&self) -> &'static str {
        "resource-load"
    }

    fn attempt<'a>(
        &'a self,
        transport: &'a dyn Transport,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<f64>> {
        Box::pin(async move {
            let rtt = transport.resource_load(timeout).await?;
            Ok(rtt.as_secs_f64() * 1000.0)
        })
    }
}

/// Times a connection handshake.
pub struct HandshakeProbe;

impl LatencyProbe for HandshakeProbe {
    fn name(&self) -> &'static str {
        "handshake"
    }

    fn attempt<'a>(
        &'a self,
        transport: &'a dyn Transport,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<f64>> {
        Box::pin(async move {
            let rtt = transport.handshake(timeout).await?;
            Ok(rtt.as_secs_f64() * 1000.0)
        })
    }
}

/// Last-resort estimate from the known connection class. Fails when no class
/// is known.
pub struct HeuristicProbe {
    class: Option<ConnectionClass>,
}

impl HeuristicProbe {
    pub fn new(class: Option<ConnectionClass>) -> Self {
        Self { class }
    }
}

impl LatencyProbe for HeuristicProbe {
    fn name(&self) -> &'static str {
        "heuristic"
    }

    fn attempt<'a>(
        &'a self,
        _transport: &'a dyn Transport,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<f64>> {
        Box::pin(async move {
            self.class
                .map(|class| class.typical_rtt_ms())
                .ok_or_else(|| Error::Connectivity("connection class unknown".to_string()))
        })
    }
}

/// The default chain: request, resource load, handshake, heuristic.
pub fn default_strategies(class: Option<ConnectionClass>) -> Vec<Box<dyn LatencyProbe>> {
    vec![
        Box::new(RequestProbe),
        Box::new(ResourceLoadProbe),
        Box::new(HandshakeProbe),
        Box::new(HeuristicProbe::new(class)),
    ]
}

/// Latency samples of one series and the statistics derived from them.
///
/// Statistics cover successful samples only; `packet_loss_percent` accounts
/// for the failed attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyResultSet {
    pub samples: Vec<Sample>,
    pub attempted: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub median_ms: f64,
    pub p95_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
}

impl LatencyResultSet {
    pub fn from_samples(samples: Vec<Sample>, attempted: usize) -> Self {
        let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
        Self {
            attempted,
            min_ms: stats::min(&values),
            max_ms: stats::max(&values),
            avg_ms: stats::mean(&values),
            median_ms: stats::median(&values),
            p95_ms: stats::percentile(&values, 95.0),
            jitter_ms: stats::jitter(&values),
            packet_loss_percent: stats::packet_loss(attempted, values.len()) * 100.0,
            samples,
        }
    }

    pub fn received(&self) -> usize {
        self.samples.len()
    }
}

/// Measures latency against one transport.
///
/// # Examples
///
/// ```no_run
/// use netpulse::latency::LatencyProber;
/// use netpulse::transport::HttpTransport;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = Arc::new(HttpTransport::new("https://speed.cloudflare.com")?);
/// let prober = LatencyProber::new(transport, None);
///
/// let result = prober
///     .measure_series(10, Duration::from_millis(200), Duration::from_secs(3))
///     .await?;
/// println!("avg {:.1} ms, jitter {:.1} ms", result.avg_ms, result.jitter_ms);
/// # Ok(())
/// # }
/// ```
pub struct LatencyProber {
    transport: Arc<dyn Transport>,
    strategies: Vec<Box<dyn LatencyProbe>>,
    callback: Option<CallbackRef>,
    cancellation_token: CancellationToken,
}

impl LatencyProber {
    /// Creates a prober using the default strategy chain.
    pub fn new(transport: Arc<dyn Transport>, class: Option<ConnectionClass>) -> Self {
        Self::with_strategies(transport, default_strategies(class))
    }

    pub fn from_config(transport: Arc<dyn Transport>, config: &Config) -> Self {
        Self::new(transport, config.connection_class)
    }

    /// Creates a prober with an explicit, ordered strategy chain.
    pub fn with_strategies(
        transport: Arc<dyn Transport>,
        strategies: Vec<Box<dyn LatencyProbe>>,
    ) -> Self {
        Self {
            transport,
            strategies,
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

    /// Upper bound on how long [`measure_series`](Self::measure_series) can
    /// run: every strategy timing out on every attempt.
    pub fn max_series_duration(&self, count: usize, interval: Duration, timeout: Duration) -> Duration {
        (timeout * self.strategies.len() as u32 + interval) * count as u32
    }

    /// Takes one sample, walking the strategy chain until one succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connectivity`] when every strategy failed or timed out.
    pub async fn measure_once(&self, timeout: Duration) -> Result<f64> {
        for strategy in &self.strategies {
            match time::timeout(timeout, strategy.attempt(self.transport.as_ref(), timeout)).await
            {
                Ok(Ok(latency)) => {
                    debug!("{} probe: {:.2} ms", strategy.name(), latency);
                    return Ok(latency);
                }
                Ok(Err(e)) => debug!("{} probe failed: {}", strategy.name(), e),
                Err(_) => debug!("{} probe timed out after {:?}", strategy.name(), timeout),
            }
        }
        Err(Error::Connectivity(format!(
            "all {} latency strategies failed for {}",
            self.strategies.len(),
            self.transport.endpoint()
        )))
    }

    /// Makes `count` attempts spaced `interval` apart and aggregates the
    /// successful ones.
    ///
    /// A progress event is emitted after every attempt. Individual failures
    /// only count towards packet loss.
    ///
    /// # Errors
    ///
    /// [`Error::Connectivity`] when no attempt succeeded, [`Error::Cancelled`]
    /// when the cancellation token fires.
    pub async fn measure_series(
        &self,
        count: usize,
        interval: Duration,
        timeout: Duration,
    ) -> Result<LatencyResultSet> {
        let mut samples = Vec::with_capacity(count);

        for attempt in 0..count {
            if attempt > 0 {
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => return Err(Error::Cancelled),
                    _ = time::sleep(interval) => {}
                }
            }
            if self.cancellation_token.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let outcome = tokio::select! {
                _ = self.cancellation_token.cancelled() => return Err(Error::Cancelled),
                outcome = self.measure_once(timeout) => outcome,
            };

            let percentage = (attempt + 1) as f64 / count as f64 * 100.0;
            let mut event = ProgressEvent::new(TestPhase::Latency, percentage);
            match outcome {
                Ok(latency) => {
                    samples.push(Sample::now(latency));
                    event = event.with_latency(latency);
                }
                Err(e) => debug!("Latency attempt {} of {} failed: {}", attempt + 1, count, e),
            }
            notify(&self.callback, event);
        }

        if samples.is_empty() {
            return Err(Error::Connectivity(format!(
                "no latency samples out of {} attempts to {}",
                count,
                self.transport.endpoint()
            )));
        }

        let result = LatencyResultSet::from_samples(samples, count);
        info!(
            "Latency: avg {:.2} ms, median {:.2} ms, jitter {:.2} ms, loss {:.1}%",
            result.avg_ms, result.median_ms, result.jitter_ms, result.packet_loss_percent
        );
        Ok(result)
    }
}
