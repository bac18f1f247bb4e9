//! Durable window-to-workspace records.
//!
//! The store lives behind an async mutex shared by the filtering engine and
//! the event dispatcher. Every mutation is persisted with an atomic replace:
//! the new state is written to `<path>.tmp`, synced, then renamed over the
//! state file.

use i3pm_core::{is_valid_workspace, Clock, WindowId, WindowRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Version written to new state files.
pub const STATE_VERSION: u32 = 1;

/// The store as shared between tasks.
pub type SharedStore = Arc<Mutex<StateStore>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid workspace {workspace} for window {window_id}")]
    InvalidWorkspace { window_id: WindowId, workspace: i32 },

    #[error("State file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Record fields as stored under the window id key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    workspace_number: i32,
    floating: bool,
    #[serde(default)]
    project_name: String,
    #[serde(default)]
    app_name: String,
    #[serde(default)]
    window_class: String,
    #[serde(default)]
    last_seen: u64,
}

/// On-disk layout.
#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: u32,
    #[serde(default)]
    last_updated: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    active_project: Option<String>,
    #[serde(default)]
    windows: BTreeMap<WindowId, StoredRecord>,
}

/// Window records plus the active project.
pub struct StateStore {
    path: Option<PathBuf>,
    records: HashMap<WindowId, WindowRecord>,
    active_project: Option<String>,
    max_records: usize,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .field("records", &self.records.len())
            .field("active_project", &self.active_project)
            .finish()
    }
}

impl StateStore {
    /// A store that never touches the filesystem.
    pub fn in_memory(max_records: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: None,
            records: HashMap::new(),
            active_project: None,
            max_records: max_records.max(1),
            clock,
        }
    }

    /// Load the store from `path`.
    ///
    /// A missing file yields an empty store. A file that cannot be parsed, or
    /// carries an unsupported version, is renamed aside and also yields an
    /// empty store. A path that cannot be read at all is logged and the store
    /// starts empty; later writes to it report their own errors.
    pub async fn load(
        path: impl Into<PathBuf>,
        max_records: usize,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let path = path.into();
        let mut store = Self {
            path: Some(path.clone()),
            ..Self::in_memory(max_records, clock)
        };

        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("No state file at {}, starting empty", path.display());
                return store;
            }
            Err(e) => {
                warn!(
                    "Cannot read state file {} ({}), starting empty",
                    path.display(),
                    e
                );
                return store;
            }
        };

        let state = match serde_json::from_slice::<StateFile>(&content) {
            Ok(state) if state.version == STATE_VERSION => state,
            Ok(state) => {
                store
                    .quarantine(&format!("unsupported version {}", state.version))
                    .await;
                return store;
            }
            Err(e) => {
                store.quarantine(&e.to_string()).await;
                return store;
            }
        };

        let mut skipped = 0;
        for (window_id, stored) in state.windows {
            if !is_valid_workspace(stored.workspace_number) {
                skipped += 1;
                continue;
            }
            store.records.insert(
                window_id,
                WindowRecord {
                    window_id,
                    workspace_number: stored.workspace_number,
                    floating: stored.floating,
                    project_name: stored.project_name,
                    app_name: stored.app_name,
                    window_class: stored.window_class,
                    last_seen: stored.last_seen,
                },
            );
        }
        if skipped > 0 {
            warn!("Dropped {} records with invalid workspaces", skipped);
        }
        store.active_project = state.active_project.filter(|p| !p.is_empty());
        store.evict_to(store.max_records);

        info!(
            "Loaded {} window records from {}",
            store.records.len(),
            path.display()
        );
        store
    }

    /// Move an unreadable state file out of the way. The next persist
    /// overwrites it if the rename fails.
    async fn quarantine(&self, reason: &str) {
        let Some(path) = &self.path else {
            return;
        };
        let backup = corrupt_backup_path(path, self.clock.now());
        warn!(
            "State file {} is unusable ({}), moving it to {} and starting empty",
            path.display(),
            reason,
            backup.display()
        );
        if let Err(e) = tokio::fs::rename(path, &backup).await {
            warn!("Failed to move {} aside: {}", path.display(), e);
        }
    }

    /// Current time according to the store's clock.
    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, window_id: WindowId) -> Option<&WindowRecord> {
        self.records.get(&window_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records, in no particular order.
    pub fn records(&self) -> impl Iterator<Item = &WindowRecord> {
        self.records.values()
    }

    pub fn active_project(&self) -> Option<&str> {
        self.active_project.as_deref()
    }

    /// Remember the active project. An empty name clears it.
    pub async fn set_active_project(&mut self, project: &str) -> Result<(), StoreError> {
        let project = (!project.is_empty()).then(|| project.to_string());
        if self.active_project == project {
            return Ok(());
        }
        self.active_project = project;
        self.persist().await
    }

    /// Insert or update one record and persist.
    pub async fn upsert(&mut self, record: WindowRecord) -> Result<(), StoreError> {
        if !is_valid_workspace(record.workspace_number) {
            return Err(StoreError::InvalidWorkspace {
                window_id: record.window_id,
                workspace: record.workspace_number,
            });
        }
        self.apply(record);
        self.persist().await
    }

    /// Insert or update many records with a single persistence step.
    ///
    /// Records with an invalid workspace are skipped. Returns how many were
    /// applied.
    pub async fn upsert_batch(&mut self, records: Vec<WindowRecord>) -> Result<usize, StoreError> {
        let mut applied = 0;
        for record in records {
            if !is_valid_workspace(record.workspace_number) {
                warn!(
                    "Not recording window {}: invalid workspace {}",
                    record.window_id, record.workspace_number
                );
                continue;
            }
            self.apply(record);
            applied += 1;
        }
        if applied > 0 {
            self.persist().await?;
        }
        Ok(applied)
    }

    /// Drop a record. Persists only if something was removed.
    pub async fn remove(&mut self, window_id: WindowId) -> Result<Option<WindowRecord>, StoreError> {
        let removed = self.records.remove(&window_id);
        if removed.is_some() {
            self.persist().await?;
        }
        Ok(removed)
    }

    /// Drop every record whose window is not in `live`. Returns the count.
    pub async fn garbage_collect(&mut self, live: &HashSet<WindowId>) -> Result<usize, StoreError> {
        let before = self.records.len();
        self.records.retain(|id, _| live.contains(id));
        let dropped = before - self.records.len();
        if dropped > 0 {
            info!("Garbage collected {} stale window records", dropped);
            self.persist().await?;
        }
        Ok(dropped)
    }

    /// Write the current state to disk.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.persist().await
    }

    fn apply(&mut self, mut record: WindowRecord) {
        if let Some(existing) = self.records.get(&record.window_id) {
            record.last_seen = record.last_seen.max(existing.last_seen);
            if record.app_name.is_empty() {
                record.app_name = existing.app_name.clone();
            }
            if record.window_class.is_empty() {
                record.window_class = existing.window_class.clone();
            }
        } else {
            self.evict_to(self.max_records.saturating_sub(1));
        }
        self.records.insert(record.window_id, record);
    }

    /// Evict oldest records (ties: lowest id) until at most `limit` remain.
    fn evict_to(&mut self, limit: usize) {
        while self.records.len() > limit {
            let Some(victim) = self
                .records
                .values()
                .min_by_key(|r| (r.last_seen, r.window_id))
                .map(|r| r.window_id)
            else {
                break;
            };
            debug!("Evicting window record {}", victim);
            self.records.remove(&victim);
        }
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let state = StateFile {
            version: STATE_VERSION,
            last_updated: self.clock.now(),
            active_project: self.active_project.clone(),
            windows: self
                .records
                .values()
                .map(|r| {
                    (
                        r.window_id,
                        StoredRecord {
                            workspace_number: r.workspace_number,
                            floating: r.floating,
                            project_name: r.project_name.clone(),
                            app_name: r.app_name.clone(),
                            window_class: r.window_class.clone(),
                            last_seen: r.last_seen,
                        },
                    )
                })
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&state)?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let tmp = tmp_path(path);
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn corrupt_backup_path(path: &Path, now: u64) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(format!(".corrupt-{}", now));
    PathBuf::from(name)
}
