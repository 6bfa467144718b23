//! Progressive payload sizing.
//!
//! A quick single-connection probe estimates the link speed, and the payload
//! transferred by each connection is picked from a size/speed table so that
//! slow links finish in reasonable time and fast links still run long enough
//! to be measured.

use serde::Serialize;

/// One row of the payload table. Speeds in Mbps, `[min_mbps, max_mbps)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PayloadBucket {
    pub name: &'static str,
    pub size_bytes: u64,
    pub min_mbps: f64,
    pub max_mbps: f64,
}

impl PayloadBucket {
    pub fn contains(&self, mbps: f64) -> bool {
        mbps >= self.min_mbps && mbps < self.max_mbps
    }
}

const MB: u64 = 1_000_000;

/// Payload table, ordered by ascending speed range.
pub const PAYLOAD_BUCKETS: &[PayloadBucket] = &[
    PayloadBucket { name: "tiny", size_bytes: MB, min_mbps: 0.0, max_mbps: 5.0 },
    PayloadBucket { name: "small", size_bytes: 5 * MB, min_mbps: 5.0, max_mbps: 25.0 },
    PayloadBucket { name: "medium", size_bytes: 10 * MB, min_mbps: 25.0, max_mbps: 100.0 },
    PayloadBucket { name: "large", size_bytes: 25 * MB, min_mbps: 100.0, max_mbps: 500.0 },
    PayloadBucket { name: "xlarge", size_bytes: 100 * MB, min_mbps: 500.0, max_mbps: 2_000.0 },
];

/// Bucket used when no probe estimate is available.
pub const DEFAULT_BUCKET: usize = 2;

/// Payload moved by the speed probe before a bucket is chosen.
pub const PROBE_PAYLOAD_BYTES: u64 = 2 * MB;

pub fn default_bucket() -> PayloadBucket {
    PAYLOAD_BUCKETS[DEFAULT_BUCKET]
}

/// Picks the bucket whose range contains `estimate_mbps`.
///
/// Estimates above every range get the largest bucket; anything below the
/// first range (including negative or non-finite noise) gets the smallest.
///
/// ```
/// use netpulse::payload::select_bucket;
///
/// assert_eq!(select_bucket(0.0).name, "tiny");
/// assert_eq!(select_bucket(42.0).name, "medium");
/// assert_eq!(select_bucket(10_000.0).name, "xlarge");
/// ```
pub fn select_bucket(estimate_mbps: f64) -> PayloadBucket {
    if !estimate_mbps.is_finite() {
        return if estimate_mbps == f64::INFINITY {
            PAYLOAD_BUCKETS[PAYLOAD_BUCKETS.len() - 1]
        } else {
            PAYLOAD_BUCKETS[0]
        };
    }
    if let Some(bucket) = PAYLOAD_BUCKETS.iter().find(|b| b.contains(estimate_mbps)) {
        return *bucket;
    }
    if estimate_mbps < PAYLOAD_BUCKETS[0].min_mbps {
        PAYLOAD_BUCKETS[0]
    } else {
        PAYLOAD_BUCKETS[PAYLOAD_BUCKETS.len() - 1]
    }
}
