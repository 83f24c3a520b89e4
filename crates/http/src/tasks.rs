//! Submit-and-poll request store.
//!
//! Scan, index, and compress endpoints return a request id immediately and
//! run on a worker thread; `GET /v1/requests/{id}` polls for the result. The
//! store is bounded: once full, the oldest finished entry is evicted. A
//! per-path lock set serializes compress and index operations on the same
//! file so concurrent rebuilds cannot race each other.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use uuid::Uuid;

use rx_core::types::now_ms;

/// Maximum retained entries.
const STORE_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct TaskEntry {
    pub request_id: String,
    pub kind: &'static str,
    pub status: TaskStatus,
    pub created_ms: u64,
    pub finished_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Default)]
struct StoreInner {
    entries: HashMap<String, TaskEntry>,
    order: VecDeque<String>,
}

/// Bounded, thread-safe task registry.
#[derive(Clone, Default)]
pub struct RequestStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl RequestStore {
    pub fn new() -> RequestStore {
        RequestStore::default()
    }

    /// Register a new task and return its id.
    pub fn create(&self, kind: &'static str) -> String {
        let request_id = Uuid::new_v4().to_string();
        let entry = TaskEntry {
            request_id: request_id.clone(),
            kind,
            status: TaskStatus::Queued,
            created_ms: now_ms(),
            finished_ms: None,
            result: None,
            error: None,
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.order.len() >= STORE_CAPACITY {
            // Evict the oldest finished entry; never a live one.
            if let Some(pos) = inner.order.iter().position(|id| {
                inner
                    .entries
                    .get(id)
                    .map(|e| matches!(e.status, TaskStatus::Done | TaskStatus::Failed))
                    .unwrap_or(true)
            }) {
                if let Some(id) = inner.order.remove(pos) {
                    inner.entries.remove(&id);
                }
            }
        }
        inner.order.push_back(request_id.clone());
        inner.entries.insert(request_id.clone(), entry);
        request_id
    }

    pub fn mark_running(&self, request_id: &str) {
        self.update(request_id, |entry| entry.status = TaskStatus::Running);
    }

    pub fn finish(&self, request_id: &str, result: serde_json::Value) {
        self.update(request_id, |entry| {
            entry.status = TaskStatus::Done;
            entry.finished_ms = Some(now_ms());
            entry.result = Some(result);
        });
    }

    pub fn fail(&self, request_id: &str, error: String) {
        self.update(request_id, |entry| {
            entry.status = TaskStatus::Failed;
            entry.finished_ms = Some(now_ms());
            entry.error = Some(error);
        });
    }

    pub fn get(&self, request_id: &str) -> Option<TaskEntry> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.get(request_id).cloned()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, request_id: &str, apply: impl FnOnce(&mut TaskEntry)) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.entries.get_mut(request_id) {
            apply(entry);
        }
    }
}

/// Per-path mutex set for operations that rebuild on-disk artifacts.
#[derive(Clone, Default)]
pub struct PathLocks {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>>,
}

impl PathLocks {
    pub fn new() -> PathLocks {
        PathLocks::default()
    }

    /// The lock guarding `path`; callers hold the returned mutex for the
    /// duration of the rebuild.
    pub fn lock_for(&self, path: &PathBuf) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(path.clone()).or_default().clone()
    }
}
