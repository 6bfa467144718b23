//! netpulse - client-side network quality measurement
//!
//! This library measures round-trip latency, download and upload throughput,
//! jitter and packet loss from a client endpoint, and classifies the results
//! into a five-level quality scale. Besides one-shot tests it can run a
//! continuous monitoring session that samples on an interval and keeps
//! rolling statistics.
//!
//! # Features
//!
//! - Latency probing with a fallback chain of strategies
//! - Parallel-connection throughput with progressive payload sizing
//! - Overhead compensation, peak speed and stability scoring
//! - Worst-of-five and weighted-score quality classification
//! - Monitoring sessions with pause/resume and a bounded data buffer
//! - Asynchronous I/O using tokio, cooperative cancellation
//!
//! # Example
//!
//! ```no_run
//! use netpulse::{Config, TestOrchestrator};
//!
//! # #[tokio::main]
//! # async fn main() -> netpulse::Result<()> {
//! let orchestrator = TestOrchestrator::new(Config::new())?;
//! let result = orchestrator.start_test().await?;
//! println!(
//!     "{:.1} ms, {:.1}/{:.1} Mbps, {}",
//!     result.latency.avg_ms, result.download.speed_mbps, result.upload.speed_mbps, result.quality.overall
//! );
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod endpoint;
pub mod error;
pub mod history;
pub mod latency;
pub mod monitor;
pub mod orchestrator;
pub mod payload;
pub mod progress;
pub mod quality;
pub mod reporter;
pub mod schedule;
pub mod stats;
pub mod throughput;
pub mod transport;

pub use config::{Config, ConnectionClass};
pub use endpoint::TestServer;
pub use error::{Error, Result};
pub use latency::{LatencyProber, LatencyResultSet, Sample};
pub use monitor::{MonitoringDataPoint, MonitoringManager, MonitoringSession, SessionStatus};
pub use orchestrator::{TestEvent, TestOrchestrator, TestResult};
pub use progress::{ProgressCallback, ProgressEvent, TestPhase};
pub use quality::{CompositeMethod, QualityAssessment, QualityLevel};
pub use throughput::{Direction, ThroughputEngine, ThroughputResult};
pub use transport::{HttpTransport, Transport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
