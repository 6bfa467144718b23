//! One-shot test orchestration.
//!
//! [`TestOrchestrator`] owns the phase state machine of a single test run:
//! server selection, a latency series, then download and upload throughput,
//! and finally the weighted quality assessment. Progress from each component
//! is rescaled into the run-wide 0–100% range and forwarded as
//! [`TestEvent`]s.
//!
//! The orchestrator never retries. The first unrecovered error moves the run
//! to [`TestPhase::Error`] and is returned to the caller; a stop request
//! moves it to [`TestPhase::Cancelled`] with no completion event.

use crate::config::Config;
use crate::endpoint::{http_transport_factory, ServerSelector, TestServer, TransportFactory};
use crate::latency::{LatencyProber, LatencyResultSet};
use crate::progress::{notify, CallbackRef, ProgressEvent, ProgressTracker, TestPhase};
use crate::quality::{CompositeMethod, QualityAssessment, QualityMetrics};
use crate::throughput::{ThroughputConfig, ThroughputEngine, ThroughputResult};
use crate::transport::{HttpTransport, Transport};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use log::{error, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Notification emitted by a test run.
#[derive(Debug, Clone)]
pub enum TestEvent {
    PhaseChanged { from: TestPhase, to: TestPhase },
    /// Progress rescaled into the whole run
    Progress(ProgressEvent),
    Completed(Box<TestResult>),
    Failed(String),
    Cancelled,
}

/// Receives [`TestEvent`]s. Implemented for matching closures.
pub trait EventCallback: Send + Sync {
    fn on_event(&self, event: TestEvent);
}

impl<F> EventCallback for F
where
    F: Fn(TestEvent) + Send + Sync,
{
    fn on_event(&self, event: TestEvent) {
        self(event)
    }
}

/// Final result of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub server: TestServer,
    pub latency: LatencyResultSet,
    pub download: ThroughputResult,
    pub upload: ThroughputResult,
    pub quality: QualityAssessment,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl TestResult {
    /// Headline metrics the quality assessment was computed from.
    pub fn metrics(&self) -> QualityMetrics {
        QualityMetrics {
            latency_ms: self.latency.avg_ms,
            download_mbps: self.download.speed_mbps,
            upload_mbps: self.upload.speed_mbps,
            jitter_ms: self.latency.jitter_ms,
            packet_loss_percent: self.latency.packet_loss_percent,
        }
    }
}

/// Drives one test run at a time.
///
/// # Examples
///
/// ```no_run
/// use netpulse::orchestrator::{TestEvent, TestOrchestrator};
/// use netpulse::Config;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = TestOrchestrator::new(Config::new())?.with_callback(|event: TestEvent| {
///     if let TestEvent::Progress(progress) = event {
///         println!("{:5.1}% {}", progress.percentage, progress.label);
///     }
/// });
///
/// let result = orchestrator.start_test().await?;
/// println!("overall quality: {}", result.quality.overall);
/// # Ok(())
/// # }
/// ```
pub struct TestOrchestrator {
    config: Config,
    transport: Mutex<Arc<dyn Transport>>,
    factory: Option<TransportFactory>,
    callback: Option<Arc<dyn EventCallback>>,
    state: Mutex<TestPhase>,
    cancel: Mutex<CancellationToken>,
    tracker: Arc<ProgressTracker>,
}

impl TestOrchestrator {
    /// Creates an orchestrator that talks HTTP to `config.server_url`, or to
    /// the best of `config.candidate_servers` when any are configured.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.server_url)?);
        Ok(Self::with_transport(config, transport).with_transport_factory(http_transport_factory()))
    }

    /// Creates an orchestrator over an explicit transport. Candidate servers
    /// are ignored unless a factory is also supplied.
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport: Mutex::new(transport),
            factory: None,
            callback: None,
            state: Mutex::new(TestPhase::Idle),
            cancel: Mutex::new(CancellationToken::new()),
            tracker: Arc::new(ProgressTracker::new()),
        }
    }

    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn with_callback<C: EventCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn phase(&self) -> TestPhase {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        let phase = self.phase();
        phase != TestPhase::Idle && !phase.is_terminal()
    }

    /// Requests the running test to stop. The run settles in
    /// [`TestPhase::Cancelled`] at its next cancellation check.
    pub fn stop_test(&self) {
        if self.is_running() {
            info!("Stopping test in phase {}", self.phase());
        }
        self.cancel.lock().cancel();
    }

    /// Single latency sample against the current endpoint, for live
    /// displays. `None` when every probing strategy failed.
    pub async fn current_latency(&self) -> Option<f64> {
        let transport = self.transport.lock().clone();
        LatencyProber::from_config(transport, &self.config)
            .measure_once(self.config.latency_timeout)
            .await
            .ok()
    }

    /// Runs a full test.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for a configuration that fails validation, leaving
    /// the phase untouched; [`Error::InvalidState`] if a test is already
    /// running; otherwise the first unrecovered component error,
    /// [`Error::Timeout`] when a phase overruns its budget, or
    /// [`Error::Cancelled`] after [`stop_test`](Self::stop_test).
    pub async fn start_test(&self) -> Result<TestResult> {
        self.config.validate()?;
        let token = self.begin()?;
        let started = Instant::now();

        let outcome = self.run(&token, started).await;
        let outcome = if token.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            outcome
        };

        match outcome {
            Ok(result) => {
                self.transition(TestPhase::Completed)?;
                info!(
                    "Test completed in {:.1}s: {:.2} ms, {:.2}/{:.2} Mbps, {}",
                    result.duration.as_secs_f64(),
                    result.latency.avg_ms,
                    result.download.speed_mbps,
                    result.upload.speed_mbps,
                    result.quality.overall
                );
                self.emit(TestEvent::Completed(Box::new(result.clone())));
                Ok(result)
            }
            Err(Error::Cancelled) => {
                self.transition(TestPhase::Cancelled)?;
                info!("Test cancelled");
                self.emit(TestEvent::Cancelled);
                Err(Error::Cancelled)
            }
            Err(e) => {
                error!("Test failed: {}", e);
                self.transition(TestPhase::Error)?;
                self.emit(TestEvent::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    /// Moves into `Initializing` and arms a fresh cancellation token.
    fn begin(&self) -> Result<CancellationToken> {
        let token = CancellationToken::new();
        let from = {
            let mut state = self.state.lock();
            if !state.can_transition_to(TestPhase::Initializing) {
                return Err(Error::InvalidState(format!(
                    "cannot start a test while in phase {}",
                    *state
                )));
            }
            let from = *state;
            *state = TestPhase::Initializing;
            *self.cancel.lock() = token.clone();
            from
        };
        self.tracker.reset();
        self.emit(TestEvent::PhaseChanged {
            from,
            to: TestPhase::Initializing,
        });
        Ok(token)
    }

    fn transition(&self, next: TestPhase) -> Result<()> {
        let from = {
            let mut state = self.state.lock();
            if !state.can_transition_to(next) {
                return Err(Error::InvalidState(format!(
                    "illegal phase transition {} -> {}",
                    *state, next
                )));
            }
            std::mem::replace(&mut *state, next)
        };
        self.emit(TestEvent::PhaseChanged { from, to: next });
        Ok(())
    }

    fn emit(&self, event: TestEvent) {
        if let Some(cb) = &self.callback {
            cb.on_event(event);
        }
    }

    /// Progress callback handed to components: rescales into the run-wide
    /// range and forwards as a [`TestEvent::Progress`].
    fn progress_forwarder(&self) -> CallbackRef {
        let tracker = self.tracker.clone();
        let callback = self.callback.clone();
        Arc::new(move |mut event: ProgressEvent| {
            event.percentage = tracker.scale(event.phase, event.percentage);
            if let Some(cb) = &callback {
                cb.on_event(TestEvent::Progress(event));
            }
        })
    }

    async fn bounded<T>(
        &self,
        phase: TestPhase,
        budget: Duration,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = budget + self.config.phase_grace;
        match time::timeout(limit, work).await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Timeout {
                phase: phase.label().to_string(),
                limit,
            }),
        }
    }

    async fn run(&self, token: &CancellationToken, started: Instant) -> Result<TestResult> {
        let forward = Some(self.progress_forwarder());
        notify(&forward, ProgressEvent::new(TestPhase::Initializing, 0.0));

        let (server, transport) = self.select_server(token).await?;
        *self.transport.lock() = transport.clone();
        notify(&forward, ProgressEvent::new(TestPhase::Initializing, 100.0));
        check_cancelled(token)?;

        self.transition(TestPhase::Latency)?;
        let prober = LatencyProber::from_config(transport.clone(), &self.config)
            .with_cancellation(token.clone())
            .with_callback_ref(forward.clone());
        let count = self.config.latency_sample_count;
        let budget =
            prober.max_series_duration(count, self.config.latency_interval, self.config.latency_timeout);
        let latency = self
            .bounded(
                TestPhase::Latency,
                budget,
                prober.measure_series(count, self.config.latency_interval, self.config.latency_timeout),
            )
            .await?;
        check_cancelled(token)?;

        self.transition(TestPhase::Transition)?;
        notify(&forward, ProgressEvent::new(TestPhase::Transition, 100.0));
        check_cancelled(token)?;

        let throughput = ThroughputConfig::from_config(&self.config);
        let engine = ThroughputEngine::new(transport)
            .with_cancellation(token.clone())
            .with_callback_ref(forward.clone());

        self.transition(TestPhase::Download)?;
        let download = self
            .bounded(
                TestPhase::Download,
                throughput.max_duration(),
                engine.measure_download(&throughput),
            )
            .await?;
        check_cancelled(token)?;

        self.transition(TestPhase::Upload)?;
        let upload = self
            .bounded(
                TestPhase::Upload,
                throughput.max_duration(),
                engine.measure_upload(&throughput),
            )
            .await?;
        check_cancelled(token)?;

        let metrics = QualityMetrics {
            latency_ms: latency.avg_ms,
            download_mbps: download.speed_mbps,
            upload_mbps: upload.speed_mbps,
            jitter_ms: latency.jitter_ms,
            packet_loss_percent: latency.packet_loss_percent,
        };
        let quality = QualityAssessment::assess(&metrics, CompositeMethod::WeightedScore);

        Ok(TestResult {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            server,
            latency,
            download,
            upload,
            quality,
            duration: started.elapsed(),
        })
    }

    async fn select_server(
        &self,
        token: &CancellationToken,
    ) -> Result<(TestServer, Arc<dyn Transport>)> {
        match &self.factory {
            Some(factory) if !self.config.candidate_servers.is_empty() => {
                let selector = ServerSelector::from_config(factory.clone(), &self.config)
                    .with_cancellation(token.clone());
                let selected = self
                    .bounded(
                        TestPhase::Initializing,
                        selector.max_duration(),
                        selector.select(&self.config.candidate_servers),
                    )
                    .await?;
                Ok((selected.server, selected.transport))
            }
            _ => {
                let transport = self.transport.lock().clone();
                Ok((TestServer::new("default", transport.endpoint()), transport))
            }
        }
    }
}

fn check_cancelled(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}
