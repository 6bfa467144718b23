mod common;

use common::{assert_close, MockTransport, Recorder};
use netpulse::throughput::{Direction, ThroughputConfig, ThroughputEngine};
use netpulse::{Error, ProgressEvent, TestPhase};
use std::sync::Arc;
use std::time::Duration;

fn steady_config() -> ThroughputConfig {
    ThroughputConfig {
        duration: Duration::from_secs(2),
        connections: 4,
        overhead_compensation: 0.04,
        progress_interval: Duration::from_millis(200),
        probe: false,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_constant_rate_download() {
    // 4 connections at 12.5 Mbps each
    let engine = ThroughputEngine::new(Arc::new(MockTransport::new().with_rate_mbps(12.5)));

    let result = engine.measure_download(&steady_config()).await.unwrap();

    let expected = 50.0 * 1.04;
    assert_eq!(result.direction, Direction::Download);
    assert_close(result.avg_speed_mbps, expected, 0.10);
    assert_close(result.peak_speed_mbps, expected, 0.15);
    assert_eq!(result.speed_mbps, result.avg_speed_mbps);
    assert_eq!(result.connection_count, 4);
    assert_eq!(result.failed_connections, 0);
    assert_eq!(result.payload, "medium");
    assert!(!result.simulated);
    assert!(result.stability > 80.0, "stability {}", result.stability);
    assert!(
        (8..=10).contains(&result.speed_history.len()),
        "{} samples",
        result.speed_history.len()
    );
}

#[tokio::test(start_paused = true)]
async fn test_constant_rate_upload() {
    let engine = ThroughputEngine::new(Arc::new(MockTransport::new().with_rate_mbps(5.0)));
    let config = ThroughputConfig {
        overhead_compensation: 0.0,
        ..steady_config()
    };

    let result = engine.measure_upload(&config).await.unwrap();

    assert_eq!(result.direction, Direction::Upload);
    assert_close(result.avg_speed_mbps, 20.0, 0.10);
}

#[tokio::test(start_paused = true)]
async fn test_progress_events_are_monotonic() {
    let recorder = Recorder::new();
    let sink = recorder.clone();
    let engine = ThroughputEngine::new(Arc::new(MockTransport::new()))
        .with_callback(move |event: ProgressEvent| sink.push(event));

    engine.measure_download(&steady_config()).await.unwrap();

    let events = recorder.events();
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.phase == TestPhase::Download));
    assert!(events.iter().all(|e| e.speed_mbps.is_some()));
    assert!(events.windows(2).all(|w| w[0].percentage <= w[1].percentage));
    assert!(events.iter().all(|e| e.percentage <= 100.0));
}

#[tokio::test(start_paused = true)]
async fn test_probe_selects_payload_bucket() {
    let engine = ThroughputEngine::new(Arc::new(MockTransport::new().with_rate_mbps(12.5)));
    let config = ThroughputConfig {
        duration: Duration::from_secs(1),
        probe: true,
        ..steady_config()
    };

    let result = engine.measure_download(&config).await.unwrap();
    assert_eq!(result.payload, "small");
}

#[tokio::test(start_paused = true)]
async fn test_stops_when_all_connections_finish() {
    let engine = ThroughputEngine::new(Arc::new(MockTransport::new().with_rate_mbps(800.0)));
    let config = ThroughputConfig {
        duration: Duration::from_secs(5),
        ..steady_config()
    };

    let result = engine.measure_download(&config).await.unwrap();

    assert_eq!(result.bytes_transferred, 40_000_000);
    assert!(result.duration < Duration::from_secs(1), "{:?}", result.duration);
}

#[tokio::test(start_paused = true)]
async fn test_partial_connection_failure_is_tolerated() {
    let transport = MockTransport::new().with_rate_mbps(12.5).with_failing_transfers(2);
    let engine = ThroughputEngine::new(Arc::new(transport));

    let result = engine.measure_download(&steady_config()).await.unwrap();

    assert_eq!(result.failed_connections, 2);
    assert_close(result.avg_speed_mbps, 25.0 * 1.04, 0.10);
}

#[tokio::test(start_paused = true)]
async fn test_total_connection_failure_is_transfer_error() {
    let transport = MockTransport::new().with_failing_transfers(4);
    let engine = ThroughputEngine::new(Arc::new(transport));

    let result = engine.measure_download(&steady_config()).await;
    assert!(matches!(result, Err(Error::Transfer(_))));
}

#[tokio::test(start_paused = true)]
async fn test_simulated_fallback_is_opt_in() {
    let transport = MockTransport::new().with_failing_transfers(4);
    let engine = ThroughputEngine::new(Arc::new(transport));
    let config = ThroughputConfig {
        simulated_fallback: true,
        ..steady_config()
    };

    let result = engine.measure_upload(&config).await.unwrap();

    assert!(result.simulated);
    assert_eq!(result.failed_connections, 4);
    assert!(result.avg_speed_mbps > 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_transfer() {
    let engine = ThroughputEngine::new(Arc::new(MockTransport::new()));
    let token = engine.cancellation_token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        token.cancel();
    });

    let start = tokio::time::Instant::now();
    let result = engine.measure_download(&steady_config()).await;

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_zero_connections_rejected() {
    let engine = ThroughputEngine::new(Arc::new(MockTransport::new()));
    let config = ThroughputConfig {
        connections: 0,
        ..steady_config()
    };
    assert!(matches!(engine.measure_download(&config).await, Err(Error::Config(_))));
}
