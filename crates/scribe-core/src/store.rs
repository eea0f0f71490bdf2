//! Finished transcripts: durable Sled store, or DashMap for in-memory runs.

use std::path::Path;

use chrono::{DateTime, Local, NaiveDateTime};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::engine::Segment;
use crate::error::ScribeResult;

const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

/// Persisted record, serialized as `{id, text, chunks, fileName, transcriptionName, createdAt}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptRecord {
    pub id: String,
    pub text: String,
    pub chunks: Vec<Segment>,
    pub file_name: String,
    pub transcription_name: String,
    pub created_at: String,
}

impl TranscriptRecord {
    pub fn new(
        id: impl Into<String>,
        file_name: impl Into<String>,
        text: impl Into<String>,
        chunks: Vec<Segment>,
        now: DateTime<Local>,
    ) -> Self {
        let file_name = file_name.into();
        let stamp = now.format(TIMESTAMP_FORMAT).to_string();
        Self {
            id: id.into(),
            text: text.into(),
            chunks,
            transcription_name: format!("{} - {}", file_name, stamp),
            file_name,
            created_at: stamp,
        }
    }

    fn created(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.created_at, TIMESTAMP_FORMAT).ok()
    }
}

/// Key-value persistence for finished jobs, keyed by job id.
pub trait ResultStore: Send + Sync {
    fn contains(&self, id: &str) -> ScribeResult<bool>;
    fn insert(&self, record: &TranscriptRecord) -> ScribeResult<()>;
    fn update(&self, record: &TranscriptRecord) -> ScribeResult<()>;
    fn get(&self, id: &str) -> ScribeResult<Option<TranscriptRecord>>;
    /// All records, oldest first.
    fn list(&self) -> ScribeResult<Vec<TranscriptRecord>>;
    /// Returns whether a record was removed.
    fn remove(&self, id: &str) -> ScribeResult<bool>;
}

fn sort_oldest_first(records: &mut [TranscriptRecord]) {
    records.sort_by(|a, b| a.created().cmp(&b.created()).then_with(|| a.id.cmp(&b.id)));
}

/// Sled-backed store: one JSON value per job id.
pub struct SledResultStore {
    db: sled::Db,
}

impl SledResultStore {
    pub fn open(path: impl AsRef<Path>) -> ScribeResult<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn put(&self, record: &TranscriptRecord) -> ScribeResult<()> {
        let value = serde_json::to_vec(record)?;
        self.db.insert(record.id.as_bytes(), value)?;
        self.db.flush()?;
        Ok(())
    }
}

impl ResultStore for SledResultStore {
    fn contains(&self, id: &str) -> ScribeResult<bool> {
        Ok(self.db.contains_key(id.as_bytes())?)
    }

    fn insert(&self, record: &TranscriptRecord) -> ScribeResult<()> {
        self.put(record)
    }

    fn update(&self, record: &TranscriptRecord) -> ScribeResult<()> {
        self.put(record)
    }

    fn get(&self, id: &str) -> ScribeResult<Option<TranscriptRecord>> {
        match self.db.get(id.as_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> ScribeResult<Vec<TranscriptRecord>> {
        let mut out = Vec::new();
        for entry in self.db.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice::<TranscriptRecord>(&value) {
                Ok(rec) => out.push(rec),
                Err(e) => tracing::warn!(
                    target: "scribe::store",
                    "skipping unreadable record {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        sort_oldest_first(&mut out);
        Ok(out)
    }

    fn remove(&self, id: &str) -> ScribeResult<bool> {
        let removed = self.db.remove(id.as_bytes())?.is_some();
        self.db.flush()?;
        Ok(removed)
    }
}

/// In-memory store for `storage_path = ":memory:"`.
#[derive(Default)]
pub struct MemoryResultStore {
    records: DashMap<String, TranscriptRecord>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultStore for MemoryResultStore {
    fn contains(&self, id: &str) -> ScribeResult<bool> {
        Ok(self.records.contains_key(id))
    }

    fn insert(&self, record: &TranscriptRecord) -> ScribeResult<()> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn update(&self, record: &TranscriptRecord) -> ScribeResult<()> {
        self.records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> ScribeResult<Option<TranscriptRecord>> {
        Ok(self.records.get(id).map(|r| r.value().clone()))
    }

    fn list(&self) -> ScribeResult<Vec<TranscriptRecord>> {
        let mut out: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        sort_oldest_first(&mut out);
        Ok(out)
    }

    fn remove(&self, id: &str) -> ScribeResult<bool> {
        Ok(self.records.remove(id).is_some())
    }
}
