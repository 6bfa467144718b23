//! Terminal reporting in a task of its own.
//!
//! Measurement code only pushes messages into an unbounded channel; the
//! reporter task formats and prints them, keeping terminal I/O off the
//! sampling path.

use crate::latency::LatencyResultSet;
use crate::monitor::{MonitorCallback, MonitorEvent, MonitoringDataPoint, MonitoringSession};
use crate::orchestrator::{EventCallback, TestEvent, TestResult};
use crate::progress::{ProgressEvent, TestPhase};
use crate::throughput::ThroughputResult;
use tokio::sync::mpsc;

/// Message sent to the reporter task.
#[derive(Debug, Clone)]
pub enum ReportMessage {
    Phase(TestPhase),
    Progress(ProgressEvent),
    DataPoint(MonitoringDataPoint),
    Notice(String),
    /// Ends the reporter task
    Complete,
}

/// Cloneable sending side of the reporter channel.
///
/// # Examples
///
/// ```
/// use netpulse::reporter::{ReportMessage, Reporter};
/// use netpulse::{ProgressEvent, TestPhase};
///
/// # #[tokio::main]
/// # async fn main() {
/// let (reporter, mut receiver) = Reporter::new();
/// reporter.progress(ProgressEvent::new(TestPhase::Download, 50.0).with_speed(93.5));
/// reporter.complete();
///
/// assert!(matches!(receiver.recv().await, Some(ReportMessage::Progress(_))));
/// assert!(matches!(receiver.recv().await, Some(ReportMessage::Complete)));
/// # }
/// ```
#[derive(Clone)]
pub struct Reporter {
    sender: mpsc::UnboundedSender<ReportMessage>,
}

impl Reporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ReportMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn phase(&self, phase: TestPhase) {
        let _ = self.sender.send(ReportMessage::Phase(phase));
    }

    pub fn progress(&self, event: ProgressEvent) {
        let _ = self.sender.send(ReportMessage::Progress(event));
    }

    pub fn data_point(&self, point: MonitoringDataPoint) {
        let _ = self.sender.send(ReportMessage::DataPoint(point));
    }

    pub fn notice(&self, text: impl Into<String>) {
        let _ = self.sender.send(ReportMessage::Notice(text.into()));
    }

    pub fn complete(&self) {
        let _ = self.sender.send(ReportMessage::Complete);
    }
}

impl EventCallback for Reporter {
    fn on_event(&self, event: TestEvent) {
        match event {
            TestEvent::PhaseChanged { to, .. } => self.phase(to),
            TestEvent::Progress(progress) => self.progress(progress),
            TestEvent::Failed(reason) => self.notice(format!("Test failed: {}", reason)),
            TestEvent::Cancelled => self.notice("Test cancelled"),
            TestEvent::Completed(_) => {}
        }
    }
}

impl MonitorCallback for Reporter {
    fn on_event(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::DataPoint(point) => self.data_point(point),
            MonitorEvent::StatusChanged(status) => self.notice(format!("Monitoring {:?}", status)),
            MonitorEvent::TickSkipped(reason) => self.notice(format!("Sample skipped: {}", reason)),
        }
    }
}

/// Prints messages until `Complete` arrives or every sender is gone. In
/// JSON mode nothing is printed, the final document is written by the
/// caller.
pub async fn run_reporter_task(mut receiver: mpsc::UnboundedReceiver<ReportMessage>, json_mode: bool) {
    while let Some(message) = receiver.recv().await {
        if json_mode {
            if matches!(message, ReportMessage::Complete) {
                break;
            }
            continue;
        }
        match message {
            ReportMessage::Phase(phase) if !phase.is_terminal() && phase != TestPhase::Idle => {
                println!("-- {}", phase.label());
            }
            ReportMessage::Phase(_) => {}
            ReportMessage::Progress(event) => {
                if let Some(line) = format_progress(&event) {
                    println!("{}", line);
                }
            }
            ReportMessage::DataPoint(point) => println!("{}", format_data_point(&point)),
            ReportMessage::Notice(text) => println!("{}", text),
            ReportMessage::Complete => break,
        }
    }
}

/// Splits a rate into a value and a Mbits/Gbits unit.
pub fn format_rate(mbps: f64) -> (f64, &'static str) {
    if mbps >= 1_000.0 {
        (mbps / 1_000.0, "Gbits/sec")
    } else {
        (mbps, "Mbits/sec")
    }
}

/// Splits a byte count into a value and a KBytes/MBytes/GBytes unit.
pub fn format_bytes(bytes: u64) -> (f64, &'static str) {
    if bytes >= 1_000_000_000 {
        (bytes as f64 / 1_000_000_000.0, "GBytes")
    } else if bytes >= 1_000_000 {
        (bytes as f64 / 1_000_000.0, "MBytes")
    } else {
        (bytes as f64 / 1_000.0, "KBytes")
    }
}

/// One progress line, or `None` for events carrying no measurement.
pub fn format_progress(event: &ProgressEvent) -> Option<String> {
    if let Some(speed) = event.speed_mbps {
        let (value, unit) = format_rate(speed);
        Some(format!(
            "[{:5.1}%] {:<18} {:8.2} {}",
            event.percentage, event.label, value, unit
        ))
    } else {
        event.latency_ms.map(|latency| {
            format!(
                "[{:5.1}%] {:<18} {:8.2} ms",
                event.percentage, event.label, latency
            )
        })
    }
}

pub fn format_data_point(point: &MonitoringDataPoint) -> String {
    format!(
        "{}  latency {:7.2} ms  jitter {:6.2} ms  loss {:4.1}%  down {:8.2} Mbps  up {:8.2} Mbps  [{}]",
        point.timestamp.format("%H:%M:%S"),
        point.latency_ms,
        point.jitter_ms,
        point.packet_loss_percent,
        point.download_mbps,
        point.upload_mbps,
        point.quality
    )
}

pub fn format_latency(latency: &LatencyResultSet) -> String {
    format!(
        "Latency   avg {:.2} ms  median {:.2} ms  p95 {:.2} ms  min {:.2} ms  max {:.2} ms\n\
         Jitter    {:.2} ms\n\
         Loss      {:.1}% ({}/{} samples)",
        latency.avg_ms,
        latency.median_ms,
        latency.p95_ms,
        latency.min_ms,
        latency.max_ms,
        latency.jitter_ms,
        latency.packet_loss_percent,
        latency.received(),
        latency.attempted
    )
}

fn format_throughput(label: &str, result: &ThroughputResult) -> String {
    let (speed, unit) = format_rate(result.speed_mbps);
    let (peak, peak_unit) = format_rate(result.peak_speed_mbps);
    let (bytes, bytes_unit) = format_bytes(result.bytes_transferred);
    format!(
        "{:<9} {:.2} {}  peak {:.2} {}  {:.2} {} in {:.2}s  stability {:.0}  {} connections ({} failed){}",
        label,
        speed,
        unit,
        peak,
        peak_unit,
        bytes,
        bytes_unit,
        result.duration.as_secs_f64(),
        result.stability,
        result.connection_count,
        result.failed_connections,
        if result.simulated { "  [simulated]" } else { "" }
    )
}

/// Multi-line summary of a completed test.
pub fn format_summary(result: &TestResult) -> String {
    let quality = &result.quality;
    format!(
        "- - - - - - - - - - - - - - - - - - - - - - - - -\n\
         Server    {} ({})\n\
         {}\n\
         {}\n\
         {}\n\
         Quality   {} (score {:.0})  latency {}  download {}  upload {}  jitter {}  loss {}",
        result.server.id,
        result.server.url,
        format_latency(&result.latency),
        format_throughput("Download", &result.download),
        format_throughput("Upload", &result.upload),
        quality.overall,
        quality.score,
        quality.latency,
        quality.download,
        quality.upload,
        quality.jitter,
        quality.packet_loss
    )
}

/// Summary of a finished monitoring session.
pub fn format_session(session: &MonitoringSession) -> String {
    let stats = &session.statistics;
    let overall = stats
        .overall_quality
        .map(|q| q.to_string())
        .unwrap_or_else(|| "n/a".to_string());
    format!(
        "Session {}: {} points ({} samples, {:.1}% loss)\n\
         Averages  latency {:.2} ms  jitter {:.2} ms  down {:.2} Mbps  up {:.2} Mbps\n\
         Overall   {}",
        session.id,
        session.len(),
        session.attempts,
        session.packet_loss_percent(),
        stats.avg_latency_ms,
        stats.avg_jitter_ms,
        stats.avg_download_mbps,
        stats.avg_upload_mbps,
        overall
    )
}
