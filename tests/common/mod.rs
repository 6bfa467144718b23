// Scripted transport shared by the integration tests.
// All timing goes through tokio::time so tests can run with paused time.

#![allow(dead_code)]

use futures::future::BoxFuture;
use netpulse::transport::{ByteCounter, Transport};
use netpulse::{Error, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Granularity at which mock transfers move bytes.
pub const CHUNK_INTERVAL: Duration = Duration::from_millis(10);

/// Network stand-in with scripted latencies and constant-rate transfers.
///
/// `request_rtt` pops from the latency script (`None` entries fail) and falls
/// back to `default_latency` once the script is empty. Transfers move
/// `rate_mbps` per connection until done or cancelled; the first
/// `failing_transfers` calls fail instead.
#[derive(Clone)]
pub struct MockTransport {
    name: String,
    latencies: Arc<Mutex<VecDeque<Option<f64>>>>,
    default_latency: Option<f64>,
    resource_latency: Option<f64>,
    handshake_latency: Option<f64>,
    rate_mbps: f64,
    failing_transfers: Arc<AtomicUsize>,
    transfer_calls: Arc<AtomicUsize>,
    latency_calls: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            name: "mock://speed.test".to_string(),
            latencies: Arc::new(Mutex::new(VecDeque::new())),
            default_latency: Some(15.0),
            resource_latency: None,
            handshake_latency: None,
            rate_mbps: 12.5,
            failing_transfers: Arc::new(AtomicUsize::new(0)),
            transfer_calls: Arc::new(AtomicUsize::new(0)),
            latency_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_latencies(self, script: Vec<Option<f64>>) -> Self {
        *self.latencies.lock().unwrap() = script.into();
        self
    }

    pub fn with_default_latency(mut self, latency: Option<f64>) -> Self {
        self.default_latency = latency;
        self
    }

    pub fn with_resource_latency(mut self, latency: f64) -> Self {
        self.resource_latency = Some(latency);
        self
    }

    pub fn with_handshake_latency(mut self, latency: f64) -> Self {
        self.handshake_latency = Some(latency);
        self
    }

    /// Per-connection transfer rate.
    pub fn with_rate_mbps(mut self, rate: f64) -> Self {
        self.rate_mbps = rate;
        self
    }

    pub fn with_failing_transfers(self, count: usize) -> Self {
        self.failing_transfers.store(count, Ordering::SeqCst);
        self
    }

    pub fn transfer_calls(&self) -> usize {
        self.transfer_calls.load(Ordering::SeqCst)
    }

    pub fn latency_calls(&self) -> usize {
        self.latency_calls.load(Ordering::SeqCst)
    }

    /// Replaces the remaining latency script.
    pub fn script_latencies(&self, script: Vec<Option<f64>>) {
        *self.latencies.lock().unwrap() = script.into();
    }

    async fn timed(latency: Option<f64>, timeout: Duration) -> Result<Duration> {
        match latency {
            Some(ms) => {
                let rtt = Duration::from_secs_f64(ms / 1000.0);
                if rtt > timeout {
                    sleep(timeout).await;
                    return Err(Error::Connectivity("mock probe timed out".to_string()));
                }
                sleep(rtt).await;
                Ok(rtt)
            }
            None => Err(Error::Connectivity("mock probe failed".to_string())),
        }
    }

    async fn transfer(&self, bytes: u64, counter: ByteCounter, cancel: CancellationToken) -> Result<u64> {
        self.transfer_calls.fetch_add(1, Ordering::SeqCst);

        let fail = self
            .failing_transfers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            sleep(CHUNK_INTERVAL).await;
            return Err(Error::Transfer("mock connection reset".to_string()));
        }

        let chunk = ((self.rate_mbps * 1_000_000.0 / 8.0) * CHUNK_INTERVAL.as_secs_f64()).max(1.0) as u64;
        let mut moved = 0u64;
        while moved < bytes {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(CHUNK_INTERVAL) => {}
            }
            let n = chunk.min(bytes - moved);
            counter.add(n);
            moved += n;
        }
        Ok(moved)
    }
}

impl Transport for MockTransport {
    fn endpoint(&self) -> String {
        self.name.clone()
    }

    fn request_rtt(&self, timeout: Duration) -> BoxFuture<'_, Result<Duration>> {
        Box::pin(async move {
            self.latency_calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.latencies.lock().unwrap().pop_front();
            let latency = match scripted {
                Some(entry) => entry,
                None => self.default_latency,
            };
            Self::timed(latency, timeout).await
        })
    }

    fn resource_load(&self, timeout: Duration) -> BoxFuture<'_, Result<Duration>> {
        Box::pin(Self::timed(self.resource_latency, timeout))
    }

    fn handshake(&self, timeout: Duration) -> BoxFuture<'_, Result<Duration>> {
        Box::pin(Self::timed(self.handshake_latency, timeout))
    }

    fn download(&self, bytes: u64, counter: ByteCounter, cancel: CancellationToken) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.transfer(bytes, counter, cancel))
    }

    fn upload(&self, bytes: u64, counter: ByteCounter, cancel: CancellationToken) -> BoxFuture<'_, Result<u64>> {
        Box::pin(self.transfer(bytes, counter, cancel))
    }
}

/// Collects everything a callback receives.
#[derive(Clone)]
pub struct Recorder<T> {
    events: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone> Recorder<T> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn push(&self, event: T) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<T> {
        self.events.lock().unwrap().clone()
    }
}

pub fn assert_close(actual: f64, expected: f64, tolerance: f64) {
    let diff = (actual - expected).abs();
    assert!(
        diff <= expected.abs() * tolerance,
        "expected {} within {:.0}% of {}",
        actual,
        tolerance * 100.0,
        expected
    );
}
