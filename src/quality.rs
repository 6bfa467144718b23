//! Quality classification of raw network metrics.
//!
//! Every metric maps independently onto a five-level scale through a fixed
//! threshold table. Boundaries are inclusive on the better side: a latency of
//! exactly 20 ms is excellent.
//!
//! | Metric           | Excellent | Good   | Fair    | Poor   |
//! |------------------|-----------|--------|---------|--------|
//! | Latency (ms)     | <= 20     | <= 50  | <= 100  | <= 200 |
//! | Download (Mbps)  | >= 100    | >= 25  | >= 10   | >= 3   |
//! | Upload (Mbps)    | >= 50     | >= 10  | >= 5    | >= 1   |
//! | Jitter (ms)      | <= 5      | <= 15  | <= 30   | <= 50  |
//! | Packet loss (%)  | <= 0.1    | <= 1   | <= 2.5  | <= 5   |
//!
//! Anything beyond the poor column is very poor.
//!
//! Two composite methods exist. [`CompositeMethod::WorstOfFive`] is used by
//! the monitoring session for its rolling overall quality;
//! [`CompositeMethod::WeightedScore`] is used by the one-shot test
//! orchestrator for the final result.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered quality scale; `VeryPoor < Poor < Fair < Good < Excellent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityLevel {
    VeryPoor,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl QualityLevel {
    /// Buckets a 0–100 score: 80, 60, 40 and 20 are the lower bounds of
    /// excellent, good, fair and poor.
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            QualityLevel::Excellent
        } else if score >= 60.0 {
            QualityLevel::Good
        } else if score >= 40.0 {
            QualityLevel::Fair
        } else if score >= 20.0 {
            QualityLevel::Poor
        } else {
            QualityLevel::VeryPoor
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLevel::Excellent => "excellent",
            QualityLevel::Good => "good",
            QualityLevel::Fair => "fair",
            QualityLevel::Poor => "poor",
            QualityLevel::VeryPoor => "very-poor",
        }
    }
}

impl fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold column for one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub excellent: f64,
    pub good: f64,
    pub fair: f64,
    pub poor: f64,
    pub lower_is_better: bool,
}

pub const LATENCY_MS: Thresholds = Thresholds {
    excellent: 20.0,
    good: 50.0,
    fair: 100.0,
    poor: 200.0,
    lower_is_better: true,
};

pub const DOWNLOAD_MBPS: Thresholds = Thresholds {
    excellent: 100.0,
    good: 25.0,
    fair: 10.0,
    poor: 3.0,
    lower_is_better: false,
};

pub const UPLOAD_MBPS: Thresholds = Thresholds {
    excellent: 50.0,
    good: 10.0,
    fair: 5.0,
    poor: 1.0,
    lower_is_better: false,
};

pub const JITTER_MS: Thresholds = Thresholds {
    excellent: 5.0,
    good: 15.0,
    fair: 30.0,
    poor: 50.0,
    lower_is_better: true,
};

pub const PACKET_LOSS_PERCENT: Thresholds = Thresholds {
    excellent: 0.1,
    good: 1.0,
    fair: 2.5,
    poor: 5.0,
    lower_is_better: true,
};

impl Thresholds {
    /// Level of `value`. NaN is very poor.
    pub fn classify(&self, value: f64) -> QualityLevel {
        if value.is_nan() {
            return QualityLevel::VeryPoor;
        }
        let better = |limit: f64| {
            if self.lower_is_better {
                value <= limit
            } else {
                value >= limit
            }
        };
        if better(self.excellent) {
            QualityLevel::Excellent
        } else if better(self.good) {
            QualityLevel::Good
        } else if better(self.fair) {
            QualityLevel::Fair
        } else if better(self.poor) {
            QualityLevel::Poor
        } else {
            QualityLevel::VeryPoor
        }
    }

    /// 0–100 score, linear between neighbouring thresholds.
    ///
    /// Each threshold sits on its level's lower score bound (excellent 80,
    /// good 60, fair 40, poor 20), so `QualityLevel::from_score(score(v))`
    /// agrees with `classify(v)`. The open ends run to 100 at zero (or twice
    /// the excellent speed) and to 0 at twice the poor latency (or zero
    /// speed).
    pub fn score(&self, value: f64) -> f64 {
        if value.is_nan() {
            return 0.0;
        }
        let anchors = if self.lower_is_better {
            [
                (0.0, 100.0),
                (self.excellent, 80.0),
                (self.good, 60.0),
                (self.fair, 40.0),
                (self.poor, 20.0),
                (self.poor * 2.0, 0.0),
            ]
        } else {
            [
                (0.0, 0.0),
                (self.poor, 20.0),
                (self.fair, 40.0),
                (self.good, 60.0),
                (self.excellent, 80.0),
                (self.excellent * 2.0, 100.0),
            ]
        };
        interpolate(&anchors, value)
    }
}

fn interpolate(anchors: &[(f64, f64)], x: f64) -> f64 {
    let (first_x, first_y) = anchors[0];
    if x <= first_x {
        return first_y;
    }
    for pair in anchors.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        if x <= x1 {
            if x1 == x0 {
                return y1;
            }
            return y0 + (y1 - y0) * (x - x0) / (x1 - x0);
        }
    }
    anchors[anchors.len() - 1].1
}

/// Raw inputs to a quality assessment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub latency_ms: f64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeMethod {
    /// Overall level is the worst per-metric level
    WorstOfFive,
    /// 30/30/20/10/10 weighted component score, bucketed into a level
    WeightedScore,
}

const WEIGHT_LATENCY: f64 = 0.30;
const WEIGHT_DOWNLOAD: f64 = 0.30;
const WEIGHT_UPLOAD: f64 = 0.20;
const WEIGHT_JITTER: f64 = 0.10;
const WEIGHT_PACKET_LOSS: f64 = 0.10;

/// Per-metric levels plus the composite. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub latency: QualityLevel,
    pub download: QualityLevel,
    pub upload: QualityLevel,
    pub jitter: QualityLevel,
    pub packet_loss: QualityLevel,
    pub overall: QualityLevel,
    pub score: f64,
    pub method: CompositeMethod,
}

impl QualityAssessment {
    /// Classifies `metrics` and combines the levels with `method`.
    ///
    /// ```
    /// use netpulse::quality::{CompositeMethod, QualityAssessment, QualityLevel, QualityMetrics};
    ///
    /// let metrics = QualityMetrics {
    ///     latency_ms: 20.0,
    ///     download_mbps: 150.0,
    ///     upload_mbps: 60.0,
    ///     jitter_ms: 2.0,
    ///     packet_loss_percent: 0.0,
    /// };
    /// let assessment = QualityAssessment::assess(&metrics, CompositeMethod::WorstOfFive);
    /// assert_eq!(assessment.overall, QualityLevel::Excellent);
    /// ```
    pub fn assess(metrics: &QualityMetrics, method: CompositeMethod) -> Self {
        let scores = [
            LATENCY_MS.score(metrics.latency_ms),
            DOWNLOAD_MBPS.score(metrics.download_mbps),
            UPLOAD_MBPS.score(metrics.upload_mbps),
            JITTER_MS.score(metrics.jitter_ms),
            PACKET_LOSS_PERCENT.score(metrics.packet_loss_percent),
        ];
        let levels = [
            LATENCY_MS.classify(metrics.latency_ms),
            DOWNLOAD_MBPS.classify(metrics.download_mbps),
            UPLOAD_MBPS.classify(metrics.upload_mbps),
            JITTER_MS.classify(metrics.jitter_ms),
            PACKET_LOSS_PERCENT.classify(metrics.packet_loss_percent),
        ];

        let (overall, score) = match method {
            CompositeMethod::WorstOfFive => {
                let worst = levels.iter().copied().min().unwrap_or(QualityLevel::VeryPoor);
                let score = scores.iter().copied().fold(100.0, f64::min);
                (worst, score)
            }
            CompositeMethod::WeightedScore => {
                let score = scores[0] * WEIGHT_LATENCY
                    + scores[1] * WEIGHT_DOWNLOAD
                    + scores[2] * WEIGHT_UPLOAD
                    + scores[3] * WEIGHT_JITTER
                    + scores[4] * WEIGHT_PACKET_LOSS;
                (QualityLevel::from_score(score), score)
            }
        };

        Self {
            latency: levels[0],
            download: levels[1],
            upload: levels[2],
            jitter: levels[3],
            packet_loss: levels[4],
            overall,
            score,
            method,
        }
    }
}
