mod common;

use common::{MockTransport, Recorder};
use netpulse::monitor::MonitorEvent;
use netpulse::{Config, Error, MonitoringManager, SessionStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

fn monitor_config() -> Config {
    Config::new()
        .with_latency_timeout(Duration::from_secs(1))
        .with_monitoring_interval(Duration::from_secs(2))
        .with_throughput_refresh_interval(Duration::from_secs(30))
        .with_monitoring_transfer_duration(Duration::from_millis(200))
        .with_progress_interval(Duration::from_millis(50))
        .with_parallel_connections(2)
}

fn manager(config: Config, transport: &MockTransport) -> MonitoringManager {
    MonitoringManager::with_transport(config, Arc::new(transport.clone()))
}

#[tokio::test(start_paused = true)]
async fn test_start_takes_immediate_sample() {
    let transport = MockTransport::new();
    let manager = manager(monitor_config(), &transport);

    let session = manager.start().await.unwrap();

    assert_eq!(session.status, SessionStatus::Running);
    assert_eq!(session.len(), 1);
    assert!(session.end_time.is_none());
    let point = session.latest().unwrap();
    assert!((point.latency_ms - 15.0).abs() < 0.01);
    assert!(point.download_mbps > 0.0);
    assert!(point.upload_mbps > 0.0);
    assert!(session.statistics.overall_quality.is_some());

    manager.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_ticks_append_points() {
    let transport = MockTransport::new();
    let manager = manager(monitor_config(), &transport);
    manager.start().await.unwrap();

    sleep(Duration::from_secs(7)).await;

    let session = manager.session().unwrap();
    assert_eq!(session.len(), 4);
    assert_eq!(session.statistics.sample_count, 4);
    assert_eq!(session.attempts, 4);
    manager.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_buffer_never_exceeds_capacity() {
    let transport = MockTransport::new();
    let manager = manager(monitor_config().with_max_data_points(3), &transport);
    manager.start().await.unwrap();

    for _ in 0..10 {
        sleep(Duration::from_secs(2)).await;
        assert!(manager.session().unwrap().len() <= 3);
    }

    let session = manager.stop().unwrap();
    assert_eq!(session.len(), 3);
    assert!(session.attempts > 3);
}

#[tokio::test(start_paused = true)]
async fn test_pause_preserves_points_and_resume_continues() {
    let transport = MockTransport::new();
    let manager = manager(monitor_config(), &transport);
    manager.start().await.unwrap();
    sleep(Duration::from_secs(5)).await;

    let paused = manager.pause().unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);
    let count = paused.len();
    assert_eq!(count, 3);

    sleep(Duration::from_secs(10)).await;
    let still_paused = manager.session().unwrap();
    assert_eq!(still_paused.len(), count);
    assert_eq!(still_paused.data_points, paused.data_points);

    let resumed = manager.resume().unwrap();
    assert_eq!(resumed.id, paused.id);
    assert_eq!(resumed.status, SessionStatus::Running);

    sleep(Duration::from_secs(3)).await;
    let session = manager.session().unwrap();
    assert_eq!(session.len(), count + 1);
    assert_eq!(session.statistics.sample_count, count + 1);
    manager.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_stop_stamps_end_time_and_halts() {
    let transport = MockTransport::new();
    let manager = manager(monitor_config(), &transport);
    manager.start().await.unwrap();
    sleep(Duration::from_secs(3)).await;

    let stopped = manager.stop().unwrap();
    assert_eq!(stopped.status, SessionStatus::Stopped);
    assert!(stopped.end_time.is_some());

    sleep(Duration::from_secs(10)).await;
    assert_eq!(manager.session().unwrap().len(), stopped.len());
    assert_eq!(manager.status(), SessionStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_transitions_rejected() {
    let transport = MockTransport::new();
    let manager = manager(monitor_config(), &transport);

    assert!(matches!(manager.pause(), Err(Error::InvalidState(_))));
    assert!(matches!(manager.stop(), Err(Error::InvalidState(_))));

    manager.start().await.unwrap();
    assert!(matches!(manager.start().await, Err(Error::InvalidState(_))));
    assert!(matches!(manager.resume(), Err(Error::InvalidState(_))));

    manager.pause().unwrap();
    assert!(matches!(manager.pause(), Err(Error::InvalidState(_))));

    manager.stop().unwrap();
    assert!(matches!(manager.resume(), Err(Error::InvalidState(_))));
    assert!(matches!(manager.stop(), Err(Error::InvalidState(_))));
}

#[tokio::test(start_paused = true)]
async fn test_start_fails_without_connectivity() {
    let transport = MockTransport::new().with_default_latency(None);
    let manager = manager(monitor_config(), &transport);

    let outcome = manager.start().await;

    assert!(matches!(outcome, Err(Error::Connectivity(_))));
    assert_eq!(manager.status(), SessionStatus::Stopped);
    assert!(manager.session().unwrap().end_time.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_failed_tick_is_skipped() {
    let transport = MockTransport::new();
    let recorder = Recorder::new();
    let sink = recorder.clone();
    let manager = manager(monitor_config(), &transport).with_callback(move |event: MonitorEvent| sink.push(event));
    manager.start().await.unwrap();

    transport.script_latencies(vec![None]);
    sleep(Duration::from_secs(3)).await;

    let session = manager.session().unwrap();
    assert_eq!(session.status, SessionStatus::Running);
    assert_eq!(session.len(), 1);
    assert_eq!(session.failures, 1);
    assert!(recorder
        .events()
        .iter()
        .any(|e| matches!(e, MonitorEvent::TickSkipped(_))));

    sleep(Duration::from_secs(2)).await;
    let session = manager.session().unwrap();
    assert_eq!(session.len(), 2);
    let loss = session.latest().unwrap().packet_loss_percent;
    assert!((loss - 100.0 / 3.0).abs() < 0.01, "loss {}", loss);
    manager.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_throughput_reused_between_refreshes() {
    let transport = MockTransport::new();
    let manager = manager(monitor_config(), &transport);
    manager.start().await.unwrap();

    let calls_after_start = transport.transfer_calls();
    assert_eq!(calls_after_start, 4);
    let first = manager.session().unwrap().latest().unwrap().download_mbps;

    sleep(Duration::from_secs(7)).await;

    assert_eq!(transport.transfer_calls(), calls_after_start);
    let session = manager.session().unwrap();
    for point in session.data_points.iter().skip(1) {
        assert!((point.download_mbps - first).abs() <= first * 0.05 + 1e-9);
    }
    manager.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_throughput_refreshes_after_interval() {
    let transport = MockTransport::new();
    let config = monitor_config().with_throughput_refresh_interval(Duration::from_secs(5));
    let manager = manager(config, &transport);
    manager.start().await.unwrap();
    assert_eq!(transport.transfer_calls(), 4);

    sleep(Duration::from_secs(7)).await;

    assert_eq!(transport.transfer_calls(), 8);
    manager.stop().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_start_rejects_invalid_config() {
    let transport = MockTransport::new();
    let config = monitor_config().with_monitoring_interval(Duration::ZERO);
    let manager = manager(config, &transport);

    let outcome = manager.start().await;

    assert!(matches!(outcome, Err(Error::Config(_))));
    assert!(manager.session().is_none());
    assert_eq!(manager.status(), SessionStatus::Stopped);
    assert_eq!(transport.latency_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_callback_attached_while_running() {
    let transport = MockTransport::new();
    let manager = manager(monitor_config(), &transport);
    manager.start().await.unwrap();

    let recorder = Recorder::new();
    let sink = recorder.clone();
    let manager = manager.with_callback(move |event: MonitorEvent| sink.push(event));

    sleep(Duration::from_secs(3)).await;

    assert!(recorder
        .events()
        .iter()
        .any(|e| matches!(e, MonitorEvent::DataPoint(_))));
    manager.stop().unwrap();
    assert!(recorder
        .events()
        .iter()
        .any(|e| matches!(e, MonitorEvent::StatusChanged(SessionStatus::Stopped))));
}

#[tokio::test(start_paused = true)]
async fn test_start_waits_for_first_throughput_refresh() {
    let transport = MockTransport::new();
    let manager = manager(monitor_config(), &transport);

    let begin = tokio::time::Instant::now();
    let session = manager.start().await.unwrap();
    let elapsed = begin.elapsed();

    // one latency round trip plus a 200 ms download and a 200 ms upload
    assert!(elapsed >= Duration::from_millis(400), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "{:?}", elapsed);
    assert_eq!(transport.transfer_calls(), 4);
    assert!(session.latest().unwrap().download_mbps > 0.0);
    manager.stop().unwrap();
}
