/// One-shot test with a progress callback and a Ctrl-C stop.
///
/// Run: cargo run --example test_with_progress [server-url]
use netpulse::{Config, TestEvent, TestOrchestrator};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = Config::new()
        .with_parallel_connections(4)
        .with_transfer_duration(Duration::from_secs(8));
    if let Some(url) = std::env::args().nth(1) {
        config = config.with_server_url(url);
    }

    let orchestrator = Arc::new(TestOrchestrator::new(config)?.with_callback(|event: TestEvent| {
        match event {
            TestEvent::PhaseChanged { to, .. } => println!("-- {}", to),
            TestEvent::Progress(progress) => {
                if let Some(speed) = progress.speed_mbps {
                    println!("[{:5.1}%] {:.2} Mbps", progress.percentage, speed);
                } else if let Some(latency) = progress.latency_ms {
                    println!("[{:5.1}%] {:.2} ms", progress.percentage, latency);
                }
            }
            TestEvent::Failed(reason) => eprintln!("Test failed: {}", reason),
            TestEvent::Cancelled => println!("Test cancelled"),
            TestEvent::Completed(_) => {}
        }
    }));

    // Ctrl-C stops the run at its next cancellation check
    let stopper = orchestrator.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.stop_test();
        }
    });

    let result = orchestrator.start_test().await?;
    println!("\nServer:   {}", result.server.url);
    println!(
        "Latency:  {:.2} ms (jitter {:.2} ms, loss {:.1}%)",
        result.latency.avg_ms, result.latency.jitter_ms, result.latency.packet_loss_percent
    );
    println!(
        "Download: {:.2} Mbps (peak {:.2})",
        result.download.speed_mbps, result.download.peak_speed_mbps
    );
    println!(
        "Upload:   {:.2} Mbps (peak {:.2})",
        result.upload.speed_mbps, result.upload.peak_speed_mbps
    );
    println!("Quality:  {} ({:.0})", result.quality.overall, result.quality.score);
    Ok(())
}
