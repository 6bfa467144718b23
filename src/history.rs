//! Capped history of past test results over a key-value store.
//!
//! The whole history lives under one key as a JSON array, newest first.

use crate::orchestrator::TestResult;
use crate::quality::QualityLevel;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const HISTORY_KEY: &str = "netpulse.history";

/// Host the test ran on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub version: String,
}

impl SystemInfo {
    pub fn collect() -> Self {
        let hostname = hostname::get()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            hostname,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            version: crate::VERSION.to_string(),
        }
    }
}

/// Headline numbers of one completed test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub system: SystemInfo,
    pub server_id: String,
    pub server_url: String,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss_percent: f64,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub quality: QualityLevel,
    pub score: f64,
    pub simulated: bool,
}

impl TestRecord {
    pub fn from_result(result: &TestResult) -> Self {
        Self {
            id: result.id,
            timestamp: result.timestamp,
            system: SystemInfo::collect(),
            server_id: result.server.id.clone(),
            server_url: result.server.url.clone(),
            latency_ms: result.latency.avg_ms,
            jitter_ms: result.latency.jitter_ms,
            packet_loss_percent: result.latency.packet_loss_percent,
            download_mbps: result.download.speed_mbps,
            upload_mbps: result.upload.speed_mbps,
            quality: result.quality.overall,
            score: result.quality.score,
            simulated: result.download.simulated || result.upload.simulated,
        }
    }
}

/// String key-value persistence.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: String) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// Store backed by one JSON object file. Writes go through a sibling
/// temporary file and a rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: String) -> Result<()> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value);
        self.write_all(&entries)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut entries = self.read_all()?;
        if entries.remove(key).is_some() {
            self.write_all(&entries)?;
        }
        Ok(())
    }
}

/// Newest-first list of at most `limit` records.
pub struct ResultHistory<S> {
    store: S,
    limit: usize,
}

impl<S: KeyValueStore> ResultHistory<S> {
    pub fn new(store: S, limit: usize) -> Self {
        Self { store, limit }
    }

    pub fn records(&self) -> Result<Vec<TestRecord>> {
        match self.store.get(HISTORY_KEY)? {
            Some(text) => serde_json::from_str(&text).map_err(Error::from),
            None => Ok(Vec::new()),
        }
    }

    pub fn latest(&self) -> Result<Option<TestRecord>> {
        Ok(self.records()?.into_iter().next())
    }

    /// Prepends `record`, dropping the oldest entries past the limit.
    pub fn push(&self, record: TestRecord) -> Result<()> {
        let mut records = self.records()?;
        records.insert(0, record);
        records.truncate(self.limit);
        debug!("History now holds {} records", records.len());
        self.store.set(HISTORY_KEY, serde_json::to_string(&records)?)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.remove(HISTORY_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(latency_ms: f64) -> TestRecord {
        TestRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            system: SystemInfo::collect(),
            server_id: "default".to_string(),
            server_url: "https://speed.example.net".to_string(),
            latency_ms,
            jitter_ms: 1.5,
            packet_loss_percent: 0.0,
            download_mbps: 120.0,
            upload_mbps: 40.0,
            quality: QualityLevel::Good,
            score: 71.0,
            simulated: false,
        }
    }

    #[test]
    fn test_history_is_newest_first_and_capped() {
        let history = ResultHistory::new(MemoryStore::new(), 3);
        for latency in [10.0, 20.0, 30.0, 40.0] {
            history.push(record(latency)).unwrap();
        }
        let latencies: Vec<f64> = history.records().unwrap().iter().map(|r| r.latency_ms).collect();
        assert_eq!(latencies, vec![40.0, 30.0, 20.0]);
        assert_eq!(history.latest().unwrap().unwrap().latency_ms, 40.0);
    }

    #[test]
    fn test_clear() {
        let history = ResultHistory::new(MemoryStore::new(), 5);
        history.push(record(10.0)).unwrap();
        history.clear().unwrap();
        assert!(history.records().unwrap().is_empty());
        assert!(history.latest().unwrap().is_none());
    }

    #[test]
    fn test_json_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("history.json");

        let history = ResultHistory::new(JsonFileStore::new(&path), 10);
        history.push(record(12.5)).unwrap();
        drop(history);

        let reopened = ResultHistory::new(JsonFileStore::new(&path), 10);
        let records = reopened.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].latency_ms, 12.5);
    }

    #[test]
    fn test_json_file_store_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("absent.json"));
        assert_eq!(store.get("anything").unwrap(), None);
        store.remove("anything").unwrap();
    }

    #[test]
    fn test_corrupt_history_is_an_error() {
        let store = MemoryStore::new();
        store.set(HISTORY_KEY, "not json".to_string()).unwrap();
        let history = ResultHistory::new(store, 5);
        assert!(matches!(history.records(), Err(Error::Json(_))));
    }
}
