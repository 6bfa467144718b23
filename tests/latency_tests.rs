mod common;

use common::{assert_close, MockTransport, Recorder};
use netpulse::latency::{HandshakeProbe, LatencyProbe, LatencyProber, RequestProbe};
use netpulse::{ConnectionClass, Error, ProgressEvent, TestPhase};
use std::sync::Arc;
use std::time::Duration;

const INTERVAL: Duration = Duration::from_millis(200);
const TIMEOUT: Duration = Duration::from_secs(1);

#[tokio::test(start_paused = true)]
async fn test_series_statistics() {
    let transport = MockTransport::new().with_latencies(vec![Some(10.0), Some(20.0), Some(30.0)]);
    let prober = LatencyProber::new(Arc::new(transport), None);

    let result = prober.measure_series(3, INTERVAL, TIMEOUT).await.unwrap();

    assert_close(result.avg_ms, 20.0, 0.001);
    assert_close(result.median_ms, 20.0, 0.001);
    assert_close(result.jitter_ms, 8.1649, 0.001);
    assert_eq!(result.packet_loss_percent, 0.0);
    assert!(result.min_ms <= result.median_ms && result.median_ms <= result.max_ms);
    assert!(result.min_ms <= result.avg_ms && result.avg_ms <= result.max_ms);
}

#[tokio::test(start_paused = true)]
async fn test_partial_failures_count_as_loss() {
    let transport = MockTransport::new().with_latencies(vec![
        Some(12.0),
        None,
        Some(14.0),
        None,
        Some(16.0),
    ]);
    let prober = LatencyProber::new(Arc::new(transport), None);

    let result = prober.measure_series(5, INTERVAL, TIMEOUT).await.unwrap();

    assert_eq!(result.attempted, 5);
    assert_eq!(result.received(), 3);
    assert_close(result.packet_loss_percent, 40.0, 0.001);
    assert_close(result.avg_ms, 14.0, 0.001);
    assert_close(result.min_ms, 12.0, 0.001);
    assert_close(result.max_ms, 16.0, 0.001);
}

#[tokio::test(start_paused = true)]
async fn test_total_failure_is_connectivity_error() {
    let transport = MockTransport::new().with_default_latency(None);
    let prober = LatencyProber::new(Arc::new(transport), None);

    let result = prober.measure_series(4, INTERVAL, TIMEOUT).await;
    assert!(matches!(result, Err(Error::Connectivity(_))));
}

#[tokio::test(start_paused = true)]
async fn test_fallback_to_resource_load() {
    let transport = MockTransport::new()
        .with_default_latency(None)
        .with_resource_latency(33.0);
    let prober = LatencyProber::new(Arc::new(transport), None);

    let latency = prober.measure_once(TIMEOUT).await.unwrap();
    assert_close(latency, 33.0, 0.001);
}

#[tokio::test(start_paused = true)]
async fn test_slow_strategy_falls_through_on_timeout() {
    let transport = MockTransport::new()
        .with_latencies(vec![Some(5_000.0)])
        .with_handshake_latency(41.0);
    let prober = LatencyProber::new(Arc::new(transport), None);

    let latency = prober.measure_once(TIMEOUT).await.unwrap();
    assert_close(latency, 41.0, 0.001);
}

#[tokio::test(start_paused = true)]
async fn test_heuristic_is_last_resort() {
    let transport = MockTransport::new().with_default_latency(None);
    let prober = LatencyProber::new(Arc::new(transport), Some(ConnectionClass::Cellular4g));

    let latency = prober.measure_once(TIMEOUT).await.unwrap();
    assert_eq!(latency, ConnectionClass::Cellular4g.typical_rtt_ms());
}

#[tokio::test(start_paused = true)]
async fn test_custom_strategy_chain() {
    let transport = MockTransport::new()
        .with_default_latency(Some(9.0))
        .with_handshake_latency(27.0);
    let strategies: Vec<Box<dyn LatencyProbe>> = vec![Box::new(HandshakeProbe), Box::new(RequestProbe)];
    let prober = LatencyProber::with_strategies(Arc::new(transport), strategies);

    let latency = prober.measure_once(TIMEOUT).await.unwrap();
    assert_close(latency, 27.0, 0.001);
}

#[tokio::test(start_paused = true)]
async fn test_progress_event_per_attempt() {
    let recorder = Recorder::new();
    let sink = recorder.clone();
    let transport = MockTransport::new().with_latencies(vec![Some(10.0), None, Some(12.0), Some(11.0)]);
    let prober = LatencyProber::new(Arc::new(transport), None)
        .with_callback(move |event: ProgressEvent| sink.push(event));

    prober.measure_series(4, INTERVAL, TIMEOUT).await.unwrap();

    let events = recorder.events();
    assert_eq!(events.len(), 4);
    assert!(events.iter().all(|e| e.phase == TestPhase::Latency));
    assert!(events.windows(2).all(|w| w[0].percentage <= w[1].percentage));
    assert_eq!(events[3].percentage, 100.0);
    assert!(events[0].latency_ms.is_some());
    assert!(events[1].latency_ms.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_interval_spaces_attempts() {
    let transport = MockTransport::new().with_default_latency(Some(10.0));
    let prober = LatencyProber::new(Arc::new(transport), None);

    let start = tokio::time::Instant::now();
    prober.measure_series(5, INTERVAL, TIMEOUT).await.unwrap();
    let elapsed = start.elapsed();

    // four pauses plus five 10 ms round trips
    assert!(elapsed >= Duration::from_millis(850), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(880), "{:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_series() {
    let transport = MockTransport::new().with_default_latency(Some(10.0));
    let prober = LatencyProber::new(Arc::new(transport), None);
    let token = prober.cancellation_token().clone();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
    });

    let result = prober.measure_series(50, INTERVAL, TIMEOUT).await;
    assert!(matches!(result, Err(Error::Cancelled)));
}
