//! Continuous monitoring sessions.
//!
//! A [`MonitoringManager`] owns at most one [`MonitoringSession`] at a time
//! and is its only writer. Every tick takes a latency sample, a throughput
//! sample (a real measurement every `throughput_refresh_interval`, the last
//! value with a little synthetic jitter in between), appends a data point to
//! the session's bounded buffer and recomputes the rolling statistics.
//!
//! Ticks build a complete new session snapshot and publish it in one step,
//! so readers holding an `Arc<MonitoringSession>` never see a partial update.
//!
//! ```text
//! Stopped --start--> Running --pause--> Paused --resume--> Running
//!                       \                  \
//!                        \-----stop-------->\--stop--> Stopped
//! ```

use crate::config::Config;
use crate::latency::LatencyProber;
use crate::quality::{CompositeMethod, QualityAssessment, QualityLevel, QualityMetrics};
use crate::schedule::ScheduledTask;
use crate::stats;
use crate::throughput::{ThroughputConfig, ThroughputEngine};
use crate::transport::{HttpTransport, Transport};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// Latest buffered latencies (plus the new one) used for a point's jitter.
const JITTER_WINDOW: usize = 10;

/// Relative spread applied to reused throughput values between refreshes.
const REUSE_JITTER: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Stopped,
    Running,
    Paused,
}

/// One sample of the rolling buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringDataPoint {
    pub timestamp: DateTime<Utc>,
    pub latency_ms: f64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    pub quality: QualityLevel,
}

impl MonitoringDataPoint {
    fn metrics(&self) -> QualityMetrics {
        QualityMetrics {
            latency_ms: self.latency_ms,
            download_mbps: self.download_mbps,
            upload_mbps: self.upload_mbps,
            jitter_ms: self.jitter_ms,
            packet_loss_percent: self.packet_loss_percent,
        }
    }
}

/// Means over every buffered point and the worst-of-five quality of those
/// means.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub avg_latency_ms: f64,
    pub avg_download_mbps: f64,
    pub avg_upload_mbps: f64,
    pub avg_jitter_ms: f64,
    pub avg_packet_loss_percent: f64,
    pub overall_quality: Option<QualityLevel>,
    pub sample_count: usize,
}

impl SessionStatistics {
    pub fn empty() -> Self {
        Self {
            avg_latency_ms: 0.0,
            avg_download_mbps: 0.0,
            avg_upload_mbps: 0.0,
            avg_jitter_ms: 0.0,
            avg_packet_loss_percent: 0.0,
            overall_quality: None,
            sample_count: 0,
        }
    }

    pub fn from_points(points: &VecDeque<MonitoringDataPoint>) -> Self {
        if points.is_empty() {
            return Self::empty();
        }
        let mean_of = |f: fn(&MonitoringDataPoint) -> f64| {
            let values: Vec<f64> = points.iter().map(f).collect();
            stats::mean(&values)
        };
        let averages = QualityMetrics {
            latency_ms: mean_of(|p| p.latency_ms),
            download_mbps: mean_of(|p| p.download_mbps),
            upload_mbps: mean_of(|p| p.upload_mbps),
            jitter_ms: mean_of(|p| p.jitter_ms),
            packet_loss_percent: mean_of(|p| p.packet_loss_percent),
        };
        let quality = QualityAssessment::assess(&averages, CompositeMethod::WorstOfFive);
        Self {
            avg_latency_ms: averages.latency_ms,
            avg_download_mbps: averages.download_mbps,
            avg_upload_mbps: averages.upload_mbps,
            avg_jitter_ms: averages.jitter_ms,
            avg_packet_loss_percent: averages.packet_loss_percent,
            overall_quality: Some(quality.overall),
            sample_count: points.len(),
        }
    }
}

/// Immutable snapshot of a monitoring run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSession {
    pub id: Uuid,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub data_points: VecDeque<MonitoringDataPoint>,
    pub statistics: SessionStatistics,
    pub max_data_points: usize,
    /// Latency samples attempted over the whole session
    pub attempts: u64,
    pub failures: u64,
}

impl MonitoringSession {
    fn new(max_data_points: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time: Utc::now(),
            end_time: None,
            status: SessionStatus::Running,
            data_points: VecDeque::with_capacity(max_data_points),
            statistics: SessionStatistics::empty(),
            max_data_points,
            attempts: 0,
            failures: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_points.is_empty()
    }

    pub fn latest(&self) -> Option<&MonitoringDataPoint> {
        self.data_points.back()
    }

    /// Session-wide share of failed latency samples, in percent.
    pub fn packet_loss_percent(&self) -> f64 {
        stats::packet_loss(self.attempts as usize, (self.attempts - self.failures) as usize) * 100.0
    }

    fn recent_latencies(&self) -> Vec<f64> {
        let skip = self.data_points.len().saturating_sub(JITTER_WINDOW - 1);
        self.data_points.iter().skip(skip).map(|p| p.latency_ms).collect()
    }

    /// Appends a point, evicting the oldest past capacity, and recomputes
    /// statistics.
    fn push(&mut self, point: MonitoringDataPoint) {
        self.data_points.push_back(point);
        while self.data_points.len() > self.max_data_points {
            self.data_points.pop_front();
        }
        self.statistics = SessionStatistics::from_points(&self.data_points);
    }
}

/// Notification emitted by a monitoring manager.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    StatusChanged(SessionStatus),
    DataPoint(MonitoringDataPoint),
    TickSkipped(String),
}

pub trait MonitorCallback: Send + Sync {
    fn on_event(&self, event: MonitorEvent);
}

impl<F> MonitorCallback for F
where
    F: Fn(MonitorEvent) + Send + Sync,
{
    fn on_event(&self, event: MonitorEvent) {
        self(event)
    }
}

#[derive(Default)]
struct ThroughputCache {
    download: Option<f64>,
    upload: Option<f64>,
    refreshed_at: Option<Instant>,
}

struct Inner {
    config: Config,
    transport: Arc<dyn Transport>,
    callback: Mutex<Option<Arc<dyn MonitorCallback>>>,
    session: Mutex<Option<Arc<MonitoringSession>>>,
    cache: Mutex<ThroughputCache>,
}

/// Runs monitoring sessions against one transport.
///
/// `pause`, `resume` and `stop` are synchronous but must be called from
/// within a tokio runtime.
///
/// # Examples
///
/// ```no_run
/// use netpulse::monitor::MonitoringManager;
/// use netpulse::Config;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = MonitoringManager::new(Config::new())?;
/// manager.start().await?;
///
/// tokio::time::sleep(Duration::from_secs(20)).await;
/// let session = manager.stop()?;
/// println!("{} points, overall {:?}", session.len(), session.statistics.overall_quality);
/// # Ok(())
/// # }
/// ```
pub struct MonitoringManager {
    inner: Arc<Inner>,
    task: Mutex<Option<ScheduledTask>>,
}

impl MonitoringManager {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&config.server_url)?);
        Ok(Self::with_transport(config, transport))
    }

    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                callback: Mutex::new(None),
                session: Mutex::new(None),
                cache: Mutex::new(ThroughputCache::default()),
            }),
            task: Mutex::new(None),
        }
    }

    /// Sets the event callback, replacing any previous one. Takes effect
    /// from the next event, including on a session that is already running.
    pub fn with_callback<C: MonitorCallback + 'static>(self, callback: C) -> Self {
        *self.inner.callback.lock() = Some(Arc::new(callback));
        self
    }

    /// Latest published snapshot, if a session was ever started.
    pub fn session(&self) -> Option<Arc<MonitoringSession>> {
        self.inner.session.lock().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.session()
            .map(|session| session.status)
            .unwrap_or(SessionStatus::Stopped)
    }

    /// Starts a new session, validating connectivity with one immediate
    /// sample before scheduling the periodic tick.
    ///
    /// The immediate sample is a complete data point, so it includes the
    /// session's first throughput refresh: `start` returns after roughly one
    /// latency round trip plus twice `monitoring_transfer_duration`.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] if the configuration fails validation (no session
    /// is created), [`Error::InvalidState`] if a session is running or
    /// paused, and [`Error::Connectivity`] if the first latency sample
    /// fails; the new session is then stopped.
    pub async fn start(&self) -> Result<Arc<MonitoringSession>> {
        self.inner.config.validate()?;
        let id = {
            let mut guard = self.inner.session.lock();
            if let Some(current) = guard.as_ref() {
                if current.status != SessionStatus::Stopped {
                    return Err(Error::InvalidState(format!(
                        "monitoring session {} is already {:?}",
                        current.id, current.status
                    )));
                }
            }
            let session = MonitoringSession::new(self.inner.config.max_data_points);
            let id = session.id;
            *guard = Some(Arc::new(session));
            id
        };
        *self.inner.cache.lock() = ThroughputCache::default();
        info!("Monitoring session {} started", id);
        self.inner.emit(MonitorEvent::StatusChanged(SessionStatus::Running));

        if let Err(e) = self.inner.sample(id).await {
            self.inner.finish(id);
            self.inner.emit(MonitorEvent::StatusChanged(SessionStatus::Stopped));
            return Err(match e {
                Error::Connectivity(_) => e,
                other => Error::Connectivity(other.to_string()),
            });
        }

        let session = self
            .session()
            .ok_or_else(|| Error::InvalidState("monitoring session vanished".to_string()))?;
        if session.id == id && session.status == SessionStatus::Running {
            self.schedule(id);
        }
        Ok(session)
    }

    /// Halts ticking, keeping the buffer intact.
    pub fn pause(&self) -> Result<Arc<MonitoringSession>> {
        let session = self.inner.update_status(SessionStatus::Running, SessionStatus::Paused)?;
        self.task.lock().take();
        info!("Monitoring session {} paused with {} points", session.id, session.len());
        self.inner.emit(MonitorEvent::StatusChanged(SessionStatus::Paused));
        Ok(session)
    }

    /// Restarts ticking against the same session and buffer.
    pub fn resume(&self) -> Result<Arc<MonitoringSession>> {
        let session = self.inner.update_status(SessionStatus::Paused, SessionStatus::Running)?;
        self.schedule(session.id);
        info!("Monitoring session {} resumed", session.id);
        self.inner.emit(MonitorEvent::StatusChanged(SessionStatus::Running));
        Ok(session)
    }

    /// Halts ticking and stamps the end time.
    pub fn stop(&self) -> Result<Arc<MonitoringSession>> {
        self.task.lock().take();
        let id = match self.session() {
            Some(session) if session.status != SessionStatus::Stopped => session.id,
            _ => return Err(Error::InvalidState("no active monitoring session".to_string())),
        };
        let session = self
            .inner
            .finish(id)
            .ok_or_else(|| Error::InvalidState("monitoring session vanished".to_string()))?;
        info!(
            "Monitoring session {} stopped after {} samples",
            session.id, session.attempts
        );
        self.inner.emit(MonitorEvent::StatusChanged(SessionStatus::Stopped));
        Ok(session)
    }

    fn schedule(&self, id: Uuid) {
        let inner = self.inner.clone();
        let task = ScheduledTask::start(self.inner.config.monitoring_interval, move || {
            let inner = inner.clone();
            async move { inner.tick(id).await }
        });
        *self.task.lock() = Some(task);
    }
}

impl Drop for MonitoringManager {
    fn drop(&mut self) {
        self.task.get_mut().take();
    }
}

impl Inner {
    fn emit(&self, event: MonitorEvent) {
        let callback = self.callback.lock().clone();
        if let Some(cb) = callback {
            cb.on_event(event);
        }
    }

    async fn tick(&self, id: Uuid) {
        match self.sample(id).await {
            Ok(Some(point)) => debug!(
                "Monitoring point: {:.2} ms, {:.2}/{:.2} Mbps, {}",
                point.latency_ms, point.download_mbps, point.upload_mbps, point.quality
            ),
            Ok(None) => debug!("Monitoring tick discarded, session no longer running"),
            Err(e) => {
                warn!("Monitoring tick skipped: {}", e);
                self.emit(MonitorEvent::TickSkipped(e.to_string()));
            }
        }
    }

    /// Takes one sample and publishes it. `Ok(None)` when the session
    /// stopped or paused while sampling.
    async fn sample(&self, id: Uuid) -> Result<Option<MonitoringDataPoint>> {
        let prober = LatencyProber::from_config(self.transport.clone(), &self.config);
        let latency = match prober.measure_once(self.config.latency_timeout).await {
            Ok(latency) => latency,
            Err(e) => {
                self.publish(id, |session| {
                    session.attempts += 1;
                    session.failures += 1;
                });
                return Err(e);
            }
        };

        let (download_mbps, upload_mbps) = self.throughput().await;

        let mut published = None;
        self.publish(id, |session| {
            session.attempts += 1;
            let mut recent = session.recent_latencies();
            recent.push(latency);
            let mut point = MonitoringDataPoint {
                timestamp: Utc::now(),
                latency_ms: latency,
                download_mbps,
                upload_mbps,
                jitter_ms: stats::jitter(&recent),
                packet_loss_percent: session.packet_loss_percent(),
                quality: QualityLevel::VeryPoor,
            };
            point.quality =
                QualityAssessment::assess(&point.metrics(), CompositeMethod::WorstOfFive).overall;
            session.push(point.clone());
            published = Some(point);
        });

        if let Some(point) = &published {
            self.emit(MonitorEvent::DataPoint(point.clone()));
        }
        Ok(published)
    }

    /// Applies `update` to a copy of the running session `id` and swaps it
    /// in. Does nothing if that session is not running.
    fn publish(&self, id: Uuid, update: impl FnOnce(&mut MonitoringSession)) {
        let mut guard = self.session.lock();
        let Some(current) = guard.as_ref() else {
            return;
        };
        if current.id != id || current.status != SessionStatus::Running {
            return;
        }
        let mut next = MonitoringSession::clone(current);
        update(&mut next);
        *guard = Some(Arc::new(next));
    }

    fn update_status(
        &self,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<Arc<MonitoringSession>> {
        let mut guard = self.session.lock();
        match guard.as_ref() {
            Some(current) if current.status == expected => {
                let mut updated = MonitoringSession::clone(current);
                updated.status = next;
                let updated = Arc::new(updated);
                *guard = Some(updated.clone());
                Ok(updated)
            }
            Some(current) => Err(Error::InvalidState(format!(
                "cannot move monitoring session from {:?} to {:?}",
                current.status, next
            ))),
            None => Err(Error::InvalidState("no monitoring session".to_string())),
        }
    }

    fn finish(&self, id: Uuid) -> Option<Arc<MonitoringSession>> {
        let mut guard = self.session.lock();
        let current = guard.as_ref()?;
        if current.id != id {
            return None;
        }
        let mut finished = MonitoringSession::clone(current);
        finished.status = SessionStatus::Stopped;
        finished.end_time = Some(Utc::now());
        let finished = Arc::new(finished);
        *guard = Some(finished.clone());
        Some(finished)
    }

    /// Download and upload speeds for the next point.
    ///
    /// A failed refresh keeps the previous values; with nothing measured yet
    /// the speeds are 0.
    async fn throughput(&self) -> (f64, f64) {
        let due = {
            let cache = self.cache.lock();
            cache
                .refreshed_at
                .map(|at| at.elapsed() >= self.config.throughput_refresh_interval)
                .unwrap_or(true)
        };

        if due {
            let engine = ThroughputEngine::new(self.transport.clone());
            let config = ThroughputConfig::for_monitoring(&self.config);
            let download = engine.measure_download(&config).await;
            let upload = engine.measure_upload(&config).await;

            let mut cache = self.cache.lock();
            cache.refreshed_at = Some(Instant::now());
            match download {
                Ok(result) => cache.download = Some(result.speed_mbps),
                Err(e) => warn!("Monitoring download refresh failed: {}", e),
            }
            match upload {
                Ok(result) => cache.upload = Some(result.speed_mbps),
                Err(e) => warn!("Monitoring upload refresh failed: {}", e),
            }
            return (cache.download.unwrap_or(0.0), cache.upload.unwrap_or(0.0));
        }

        let cache = self.cache.lock();
        (
            cache.download.map(jittered).unwrap_or(0.0),
            cache.upload.map(jittered).unwrap_or(0.0),
        )
    }
}

fn jittered(value: f64) -> f64 {
    let factor = rand::thread_rng().gen_range(1.0 - REUSE_JITTER..=1.0 + REUSE_JITTER);
    value * factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(latency_ms: f64, download_mbps: f64) -> MonitoringDataPoint {
        MonitoringDataPoint {
            timestamp: Utc::now(),
            latency_ms,
            download_mbps,
            upload_mbps: 60.0,
            jitter_ms: 1.0,
            packet_loss_percent: 0.0,
            quality: QualityLevel::Excellent,
        }
    }

    #[test]
    fn test_push_evicts_oldest() {
        let mut session = MonitoringSession::new(3);
        for i in 0..5 {
            session.push(point(10.0 + i as f64, 200.0));
        }
        assert_eq!(session.len(), 3);
        assert_eq!(session.data_points.front().unwrap().latency_ms, 12.0);
        assert_eq!(session.latest().unwrap().latency_ms, 14.0);
        assert_eq!(session.statistics.sample_count, 3);
        assert_eq!(session.statistics.avg_latency_ms, 13.0);
    }

    #[test]
    fn test_statistics_use_worst_of_five() {
        let mut points = VecDeque::new();
        points.push_back(point(10.0, 4.0));
        points.push_back(point(12.0, 6.0));
        let statistics = SessionStatistics::from_points(&points);
        assert_eq!(statistics.avg_download_mbps, 5.0);
        assert_eq!(statistics.overall_quality, Some(QualityLevel::Poor));
    }

    #[test]
    fn test_empty_statistics() {
        let statistics = SessionStatistics::from_points(&VecDeque::new());
        assert_eq!(statistics.sample_count, 0);
        assert_eq!(statistics.overall_quality, None);
    }

    #[test]
    fn test_session_packet_loss() {
        let mut session = MonitoringSession::new(10);
        assert_eq!(session.packet_loss_percent(), 0.0);
        session.attempts = 8;
        session.failures = 2;
        assert_eq!(session.packet_loss_percent(), 25.0);
    }

    #[test]
    fn test_recent_latencies_window() {
        let mut session = MonitoringSession::new(50);
        for i in 0..20 {
            session.push(point(i as f64, 100.0));
        }
        let recent = session.recent_latencies();
        assert_eq!(recent.len(), JITTER_WINDOW - 1);
        assert_eq!(*recent.last().unwrap(), 19.0);
    }

    #[test]
    fn test_jittered_stays_within_spread() {
        for _ in 0..100 {
            let value = jittered(100.0);
            assert!((95.0..=105.0).contains(&value));
        }
    }
}
