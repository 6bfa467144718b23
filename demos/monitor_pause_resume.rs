/// Monitoring session that pauses and resumes halfway through.
///
/// Run: cargo run --example monitor_pause_resume [server-url]
use netpulse::monitor::MonitorEvent;
use netpulse::{Config, MonitoringManager};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = Config::new()
        .with_monitoring_interval(Duration::from_secs(2))
        .with_max_data_points(30)
        .with_throughput_refresh_interval(Duration::from_secs(20));
    if let Some(url) = std::env::args().nth(1) {
        config = config.with_server_url(url);
    }

    let manager = MonitoringManager::new(config)?.with_callback(|event: MonitorEvent| match event {
        MonitorEvent::DataPoint(point) => println!(
            "{:7.2} ms  {:8.2}/{:8.2} Mbps  jitter {:5.2} ms  [{}]",
            point.latency_ms, point.download_mbps, point.upload_mbps, point.jitter_ms, point.quality
        ),
        MonitorEvent::StatusChanged(status) => println!("-- {:?}", status),
        MonitorEvent::TickSkipped(reason) => eprintln!("skipped: {}", reason),
    });

    manager.start().await?;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let paused = manager.pause()?;
    println!("Paused with {} points", paused.len());
    tokio::time::sleep(Duration::from_secs(5)).await;

    manager.resume()?;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let session = manager.stop()?;
    let stats = &session.statistics;
    println!(
        "\n{} points, avg {:.2} ms, {:.2}/{:.2} Mbps, overall {:?}",
        session.len(),
        stats.avg_latency_ms,
        stats.avg_download_mbps,
        stats.avg_upload_mbps,
        stats.overall_quality
    );
    Ok(())
}
