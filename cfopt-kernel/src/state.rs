use crate::models::ResultRecord;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use time::OffsetDateTime;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Committed result of the latest successful run.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub best_ip: Option<String>,
    pub last_results: Arc<Vec<ResultRecord>>,
    pub updated_at: Option<OffsetDateTime>,
    /// Number of commits since process start.
    pub generation: u64,
}

/// Best IP + ranked results, shared between the optimizer (sole writer),
/// the HTTP layer and the heartbeat.
///
/// A commit swaps the whole snapshot, so a reader sees either the previous
/// run or the new one, never a mix.
#[derive(Debug, Clone, Default)]
pub struct SharedOptimizationState {
    inner: Arc<RwLock<Arc<Snapshot>>>,
}

impl SharedOptimizationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.read().clone()
    }

    pub fn best_ip(&self) -> Option<String> {
        self.inner.read().best_ip.clone()
    }

    pub fn last_results(&self) -> Arc<Vec<ResultRecord>> {
        self.inner.read().last_results.clone()
    }

    /// Replaces best IP and results in one step. The best IP is the first
    /// record's, by the tool's own ranking; an empty list clears it.
    pub fn commit(&self, records: Vec<ResultRecord>) -> Arc<Snapshot> {
        let best_ip = records.first().map(|r| r.ip.clone()).filter(|ip| !ip.is_empty());
        let mut slot = self.inner.write();
        let next = Arc::new(Snapshot {
            best_ip,
            last_results: Arc::new(records),
            updated_at: Some(OffsetDateTime::now_utc()),
            generation: slot.generation + 1,
        });
        *slot = next.clone();
        next
    }
}
