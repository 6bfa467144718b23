//! Test server candidates and the per-run selection procedure.

use crate::config::{Config, ConnectionClass};
use crate::latency::LatencyProber;
use crate::quality::LATENCY_MS;
use crate::transport::{HttpTransport, Transport};
use crate::{Error, Result};
use futures::future::join_all;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Latency attempts made against each candidate during selection.
pub const SELECTION_SAMPLES: usize = 3;

/// A candidate measurement endpoint.
///
/// `latency_ms` and `score` are filled in by selection and left untouched
/// afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestServer {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    #[serde(default)]
    pub score: Option<f64>,
}

impl TestServer {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            location: None,
            latency_ms: None,
            score: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Host part of the URL, or the raw URL when it does not parse.
    pub fn host(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_string))
            .unwrap_or_else(|| self.url.clone())
    }
}

/// Builds the transport used to reach a candidate.
pub type TransportFactory = Arc<dyn Fn(&TestServer) -> Result<Arc<dyn Transport>> + Send + Sync>;

/// Factory producing [`HttpTransport`]s from each server's URL.
pub fn http_transport_factory() -> TransportFactory {
    Arc::new(|server: &TestServer| {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&server.url)?);
        Ok(transport)
    })
}

/// The winning candidate and a transport bound to it.
pub struct SelectedServer {
    pub server: TestServer,
    pub transport: Arc<dyn Transport>,
}

/// Probes every candidate with a short latency series and keeps the best.
///
/// A candidate's score is its latency score (see [`crate::quality`]) reduced
/// proportionally by its packet loss. The highest score wins; ties go to the
/// lower latency. Unreachable candidates are skipped.
pub struct ServerSelector {
    factory: TransportFactory,
    interval: Duration,
    timeout: Duration,
    class: Option<ConnectionClass>,
    cancellation_token: CancellationToken,
}

impl ServerSelector {
    pub fn new(factory: TransportFactory) -> Self {
        Self {
            factory,
            interval: Duration::from_millis(100),
            timeout: Duration::from_secs(3),
            class: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn from_config(factory: TransportFactory, config: &Config) -> Self {
        Self {
            interval: config.latency_interval.min(Duration::from_millis(100)),
            timeout: config.latency_timeout,
            class: config.connection_class,
            ..Self::new(factory)
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Longest a selection may take. Each candidate gets this long to finish
    /// its series; slower ones are skipped.
    pub fn max_duration(&self) -> Duration {
        (self.timeout + self.interval) * SELECTION_SAMPLES as u32
    }

    /// Selects the best candidate.
    ///
    /// # Errors
    ///
    /// [`Error::Connectivity`] when no candidate answered, [`Error::Cancelled`]
    /// when the token fired mid-selection.
    pub async fn select(&self, candidates: &[TestServer]) -> Result<SelectedServer> {
        if candidates.is_empty() {
            return Err(Error::Config("no candidate servers configured".to_string()));
        }

        let probes = candidates.iter().map(|candidate| self.probe(candidate));
        let outcomes = join_all(probes).await;

        if self.cancellation_token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut reachable: Vec<SelectedServer> = outcomes.into_iter().flatten().collect();
        reachable.sort_by(|a, b| compare_candidates(&a.server, &b.server));

        let best = reachable.into_iter().next().ok_or_else(|| {
            Error::Connectivity(format!("none of {} candidate servers answered", candidates.len()))
        })?;

        info!(
            "Selected server {} ({}) score {:.1}, latency {:.2} ms",
            best.server.id,
            best.server.host(),
            best.server.score.unwrap_or_default(),
            best.server.latency_ms.unwrap_or_default()
        );
        Ok(best)
    }

    async fn probe(&self, candidate: &TestServer) -> Option<SelectedServer> {
        let transport = match (self.factory)(candidate) {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Skipping server {}: {}", candidate.id, e);
                return None;
            }
        };

        let prober = LatencyProber::new(transport.clone(), self.class)
            .with_cancellation(self.cancellation_token.clone());
        let series = time::timeout(
            self.max_duration(),
            prober.measure_series(SELECTION_SAMPLES, self.interval, self.timeout),
        )
        .await;
        match series {
            Err(_) => {
                warn!(
                    "Server {} did not answer within {:?}, skipping",
                    candidate.id,
                    self.max_duration()
                );
                None
            }
            Ok(Ok(series)) => {
                let score = LATENCY_MS.score(series.avg_ms)
                    * (1.0 - series.packet_loss_percent / 100.0);
                debug!(
                    "Server {}: {:.2} ms, {:.0}% loss, score {:.1}",
                    candidate.id, series.avg_ms, series.packet_loss_percent, score
                );
                let mut server = candidate.clone();
                server.latency_ms = Some(series.avg_ms);
                server.score = Some(score);
                Some(SelectedServer { server, transport })
            }
            Ok(Err(e)) => {
                warn!("Server {} unreachable: {}", candidate.id, e);
                None
            }
        }
    }
}

/// Higher score first, then lower latency.
fn compare_candidates(a: &TestServer, b: &TestServer) -> Ordering {
    let score_a = a.score.unwrap_or(0.0);
    let score_b = b.score.unwrap_or(0.0);
    score_b
        .partial_cmp(&score_a)
        .unwrap_or(Ordering::Equal)
        .then_with(|| {
            let latency_a = a.latency_ms.unwrap_or(f64::MAX);
            let latency_b = b.latency_ms.unwrap_or(f64::MAX);
            latency_a.partial_cmp(&latency_b).unwrap_or(Ordering::Equal)
        })
}
