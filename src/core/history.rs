//! In-memory registry of backup records.
//!
//! Records are keyed by label, so iteration order is chronological. Nothing
//! is persisted: after a restart the store is repopulated by the next
//! reconciliation against the external backup history.

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::models::{self, BackupRequest, BackupStatus, JobRecord};

/// Alias resolving to the record with the greatest label.
pub const LATEST: &str = "latest";

/// Which statuses a listing should include.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusFilter(Option<Vec<BackupStatus>>);

impl StatusFilter {
    pub fn any() -> Self {
        Self(None)
    }

    pub fn only(statuses: impl IntoIterator<Item = BackupStatus>) -> Self {
        Self(Some(statuses.into_iter().collect()))
    }

    /// Build a filter from raw query values. Values that name no known
    /// status match nothing; no values at all match everything.
    pub fn from_query<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let values: Vec<&str> = values.into_iter().collect();
        if values.is_empty() {
            return Self::any();
        }
        Self::only(values.into_iter().filter_map(BackupStatus::parse))
    }

    pub fn matches(&self, status: BackupStatus) -> bool {
        match &self.0 {
            None => true,
            Some(statuses) => statuses.contains(&status),
        }
    }
}

/// A backup as reported by the external history tool.
#[derive(Debug, Clone)]
pub struct ExternalBackup {
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

/// Thread-safe store shared by the API, the runner and the refresher.
#[derive(Clone, Default)]
pub struct HistoryStore {
    inner: Arc<RwLock<BTreeMap<String, JobRecord>>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a record for a new request.
    ///
    /// The start time is moved forward one second at a time until the
    /// derived label is unused.
    pub async fn register(&self, request: BackupRequest) -> JobRecord {
        let mut map = self.inner.write().await;
        let mut started = models::now();
        while map.contains_key(&models::label_for(started)) {
            started += Duration::seconds(1);
        }

        let record = JobRecord::requested(request, started);
        map.insert(record.label().to_string(), record.clone());
        record
    }

    pub async fn get(&self, label: &str) -> Option<JobRecord> {
        let map = self.inner.read().await;
        map.get(label).cloned()
    }

    /// Apply `f` to the record with the given label, if present.
    pub async fn update<R>(&self, label: &str, f: impl FnOnce(&mut JobRecord) -> R) -> Option<R> {
        let mut map = self.inner.write().await;
        map.get_mut(label).map(f)
    }

    /// All records matching `filter`, ordered by label.
    pub async fn list(&self, filter: &StatusFilter) -> Vec<JobRecord> {
        let map = self.inner.read().await;
        map.values()
            .filter(|r| filter.matches(r.status()))
            .cloned()
            .collect()
    }

    /// Resolve a record by local label, by [`LATEST`], or by the label the
    /// external tool reported for it. When several records carry the same
    /// external label the most recent one wins.
    ///
    /// `filter` only narrows down what [`LATEST`] resolves to; explicit
    /// labels are looked up in the whole history.
    pub async fn find(&self, label: &str, filter: &StatusFilter) -> Option<JobRecord> {
        if label == LATEST {
            return self.list(filter).await.pop();
        }

        let map = self.inner.read().await;
        if let Some(record) = map.get(label) {
            return Some(record.clone());
        }

        map.values()
            .rev()
            .find(|r| r.external_label() == Some(label))
            .cloned()
    }

    /// Merge the external history into the store.
    ///
    /// Previously merged metadata is dropped first; each reported backup
    /// then either updates the record with the same label or is added as
    /// a finished record.
    pub async fn reconcile(&self, backups: Vec<ExternalBackup>) -> ReconcileStats {
        let mut map = self.inner.write().await;
        let mut stats = ReconcileStats::default();

        for record in map.values_mut() {
            record.external_metadata.clear();
        }

        for backup in backups {
            let label = models::label_for(backup.started);
            let record = map.entry(label).or_insert_with(|| {
                stats.discovered += 1;
                JobRecord::discovered(backup.started, backup.finished)
            });
            record.external_metadata.extend(backup.metadata);
            stats.merged += 1;
        }

        stats
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Entries in the external listing.
    pub merged: usize,
    /// Entries that had no local record yet.
    pub discovered: usize,
}
