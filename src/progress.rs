//! Phase tags, progress events and the callback plumbing shared by the
//! measurement components.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

/// Phase of a one-shot test run.
///
/// ```text
/// Idle -> Initializing -> Latency -> Transition -> Download -> Upload -> Completed
///            \______________ any non-terminal ______________/ -> Error | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestPhase {
    Idle,
    Initializing,
    Latency,
    Transition,
    Download,
    Upload,
    Completed,
    Error,
    Cancelled,
}

impl TestPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TestPhase::Completed | TestPhase::Error | TestPhase::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// A terminal state may only move back to `Initializing`, which starts a
    /// fresh run.
    pub fn can_transition_to(&self, next: TestPhase) -> bool {
        use TestPhase::*;
        match (self, next) {
            (Idle, Initializing)
            | (Initializing, Latency)
            | (Latency, Transition)
            | (Transition, Download)
            | (Download, Upload)
            | (Upload, Completed) => true,
            (from, Error | Cancelled) => !from.is_terminal(),
            (from, Initializing) => from.is_terminal(),
            _ => false,
        }
    }

    /// Slice of the overall 0–100% progress bar owned by this phase.
    pub fn progress_range(&self) -> Range<f64> {
        match self {
            TestPhase::Idle => 0.0..0.0,
            TestPhase::Initializing => 0.0..10.0,
            TestPhase::Latency => 10.0..30.0,
            TestPhase::Transition => 30.0..30.0,
            TestPhase::Download => 30.0..70.0,
            TestPhase::Upload => 70.0..100.0,
            TestPhase::Completed => 100.0..100.0,
            TestPhase::Error | TestPhase::Cancelled => 0.0..0.0,
        }
    }

    /// Human-readable label for progress displays.
    pub fn label(&self) -> &'static str {
        match self {
            TestPhase::Idle => "Idle",
            TestPhase::Initializing => "Selecting server",
            TestPhase::Latency => "Measuring latency",
            TestPhase::Transition => "Preparing transfer",
            TestPhase::Download => "Testing download",
            TestPhase::Upload => "Testing upload",
            TestPhase::Completed => "Completed",
            TestPhase::Error => "Failed",
            TestPhase::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A progress update.
///
/// `percentage` never decreases within one phase. Components report a local
/// 0–100 value; the orchestrator rescales it into the phase's slice of the
/// whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: TestPhase,
    pub percentage: f64,
    /// Instantaneous speed in Mbps, during transfer phases
    pub speed_mbps: Option<f64>,
    /// Latest latency sample in milliseconds, during the latency phase
    pub latency_ms: Option<f64>,
    pub label: String,
}

impl ProgressEvent {
    pub fn new(phase: TestPhase, percentage: f64) -> Self {
        Self {
            phase,
            percentage,
            speed_mbps: None,
            latency_ms: None,
            label: phase.label().to_string(),
        }
    }

    pub fn with_speed(mut self, speed_mbps: f64) -> Self {
        self.speed_mbps = Some(speed_mbps);
        self
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Callback trait for receiving progress updates from a component.
///
/// Implemented automatically for any closure with the right signature.
///
/// ```
/// use netpulse::progress::{ProgressCallback, ProgressEvent};
///
/// struct Printer;
///
/// impl ProgressCallback for Printer {
///     fn on_progress(&self, event: ProgressEvent) {
///         println!("{}: {:.0}%", event.label, event.percentage);
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

pub type CallbackRef = Arc<dyn ProgressCallback>;

pub(crate) fn notify(callback: &Option<CallbackRef>, event: ProgressEvent) {
    if let Some(cb) = callback {
        cb.on_progress(event);
    }
}

/// Maps component-local progress into the overall run and keeps the emitted
/// percentage non-decreasing.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Mutex<f64>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rescales a local 0–100 value into `phase`'s range, clamped so it
    /// never goes below what was already reported.
    pub fn scale(&self, phase: TestPhase, local: f64) -> f64 {
        let range = phase.progress_range();
        let local = if local.is_finite() { local.clamp(0.0, 100.0) } else { 0.0 };
        let global = range.start + (range.end - range.start) * local / 100.0;
        let mut last = self.last.lock();
        if global > *last {
            *last = global;
        }
        *last
    }

    pub fn current(&self) -> f64 {
        *self.last.lock()
    }

    pub fn reset(&self) {
        *self.last.lock() = 0.0;
    }
}
