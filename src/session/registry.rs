use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Result of the most recent responsiveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    #[default]
    Unknown,
}

/// Bookkeeping for one live session
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    /// Free-text tag supplied by the caller
    pub purpose: String,
    pub created_at: Instant,
    /// Wall-clock creation time, for display only
    pub created_wall: DateTime<Utc>,
    pub last_accessed: Instant,
    pub command_count: u64,
    /// Last observed shell working directory
    pub working_directory: Option<String>,
    pub health: HealthStatus,
    pub last_health_check: Option<Instant>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, purpose: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            purpose: purpose.into(),
            created_at: now,
            created_wall: Utc::now(),
            last_accessed: now,
            command_count: 0,
            working_directory: None,
            health: HealthStatus::Unknown,
            last_health_check: None,
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.last_accessed.elapsed()
    }
}

/// In-memory map of session id to metadata.
///
/// Holds no external resources. Only the lifecycle manager inserts records,
/// after the backend session has been verified.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Apply `update` to the record for `id`, inserting `default()` first if absent
    pub fn upsert(
        &self,
        id: &str,
        default: impl FnOnce() -> SessionRecord,
        update: impl FnOnce(&mut SessionRecord),
    ) -> SessionRecord {
        let mut records = self.lock();
        let record = records.entry(id.to_string()).or_insert_with(default);
        update(record);
        record.clone()
    }

    /// Apply `update` only if a record exists; never creates one
    pub fn update(&self, id: &str, update: impl FnOnce(&mut SessionRecord)) -> Option<SessionRecord> {
        let mut records = self.lock();
        let record = records.get_mut(id)?;
        update(record);
        Some(record.clone())
    }

    pub fn delete(&self, id: &str) -> Option<SessionRecord> {
        self.lock().remove(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Snapshot of all records, ordered by id
    pub fn list(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}
