//! The filtering engine: hide and restore windows for a project.
//!
//! One operation is one logical unit: a single fresh tree snapshot, one
//! batched hide command and one batched restore command. Workspace
//! positions are recorded before a window is hidden so it can come back to
//! the same place.

use crate::classifier::Classifier;
use crate::config::{FilterConfig, WorkspaceValidation};
use crate::store::SharedStore;
use i3pm_core::{
    classify, hidden_mark_for, plan_switch, CommandOp, CommandOutcome, EnvironmentSource,
    FilterMode, FilterResult, ManagerCommand, ManagerError, Operation, Ownership, SwitchRequest,
    WindowError, WindowId, WindowManager, WindowOwner, WindowRecord, WindowSnapshot,
    DEFAULT_FALLBACK_WORKSPACE,
};
use i3pm_ipc::{HiddenGroup, HiddenListing, HiddenWindow, WindowState};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Sub-commands issued per hidden window.
const HIDE_OPS: usize = 2;

/// Sub-commands issued per restored window.
const RESTORE_OPS: usize = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FilterError {
    /// A whole round trip failed; nothing after it was attempted.
    #[error(transparent)]
    Manager(#[from] ManagerError),
}

/// Engine settings taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterSettings {
    pub fallback_workspace: i32,
    pub hidden_mark: String,
    pub validation: WorkspaceValidation,
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            fallback_workspace: DEFAULT_FALLBACK_WORKSPACE,
            hidden_mark: "_i3pm_hidden".to_string(),
            validation: WorkspaceValidation::Live,
        }
    }
}

impl From<&FilterConfig> for FilterSettings {
    fn from(config: &FilterConfig) -> Self {
        Self {
            fallback_workspace: config.fallback_workspace,
            hidden_mark: config.hidden_mark.clone(),
            validation: config.workspace_validation,
        }
    }
}

/// Where a restored window goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RestoreTarget {
    window_id: WindowId,
    workspace: i32,
    floating: bool,
}

pub struct FilterEngine<M, E> {
    manager: Arc<M>,
    classifier: Classifier<E>,
    store: SharedStore,
    settings: FilterSettings,
}

impl<M: WindowManager, E: EnvironmentSource> FilterEngine<M, E> {
    pub fn new(manager: Arc<M>, env: Arc<E>, store: SharedStore, settings: FilterSettings) -> Self {
        Self {
            manager,
            classifier: Classifier::new(env),
            store,
            settings,
        }
    }

    pub fn settings(&self) -> &FilterSettings {
        &self.settings
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Run a queued request.
    pub async fn run(&self, request: &SwitchRequest) -> Result<FilterResult, FilterError> {
        match request.mode {
            FilterMode::Switch => self.switch_project(&request.target_project).await,
            FilterMode::Hide => self.hide_project(&request.target_project).await,
            FilterMode::Restore => self.restore_project(&request.target_project).await,
        }
    }

    /// Make `target` the active project.
    pub async fn switch_project(&self, target: &str) -> Result<FilterResult, FilterError> {
        let result = self.execute(FilterMode::Switch, target).await?;
        if let Err(e) = self.store.lock().await.set_active_project(target).await {
            warn!("Failed to persist active project: {}", e);
        }
        info!(
            "Switched to project '{}': hid {}, restored {}, {} errors in {}ms",
            target,
            result.hidden_count,
            result.restored_count,
            result.errors.len(),
            result.duration_ms
        );
        Ok(result)
    }

    /// Hide the visible windows of `project`.
    pub async fn hide_project(&self, project: &str) -> Result<FilterResult, FilterError> {
        let result = self.execute(FilterMode::Hide, project).await?;
        info!(
            "Hid {} windows of project '{}' in {}ms",
            result.hidden_count, project, result.duration_ms
        );
        Ok(result)
    }

    /// Restore the hidden windows of `project`.
    pub async fn restore_project(&self, project: &str) -> Result<FilterResult, FilterError> {
        let result = self.execute(FilterMode::Restore, project).await?;
        info!(
            "Restored {} windows of project '{}' in {}ms",
            result.restored_count, project, result.duration_ms
        );
        Ok(result)
    }

    async fn execute(&self, mode: FilterMode, target: &str) -> Result<FilterResult, FilterError> {
        let started = Instant::now();
        let mut result = FilterResult::empty(target, mode);

        let windows = self.manager.query_tree().await?;
        let owners = self.classifier.owners(&windows).await;
        let plan = plan_switch(&windows, &owners, mode, target, &self.settings.hidden_mark);
        debug!(
            "Plan for {:?} '{}': {} visible, {} to hide, {} to restore, {} stay hidden",
            mode,
            target,
            plan.keep_visible.len(),
            plan.to_hide.len(),
            plan.to_restore.len(),
            plan.keep_hidden.len()
        );

        let by_id: HashMap<WindowId, &WindowSnapshot> = windows.iter().map(|w| (w.id, w)).collect();

        if !plan.to_hide.is_empty() {
            self.hide(&plan.to_hide, &by_id, &owners, &mut result).await?;
        }
        if !plan.to_restore.is_empty() {
            self.restore(&plan.to_restore, &by_id, &owners, &mut result).await?;
        }

        result.hidden_count = result.hidden.len();
        result.restored_count = result.restored.len();
        result.duration_ms = started.elapsed().as_millis() as u64;
        Ok(result)
    }

    async fn hide(
        &self,
        ids: &[WindowId],
        windows: &HashMap<WindowId, &WindowSnapshot>,
        owners: &HashMap<WindowId, WindowOwner>,
        result: &mut FilterResult,
    ) -> Result<(), FilterError> {
        // Record placements before anything moves.
        {
            let mut store = self.store.lock().await;
            let now = store.now();
            let records: Vec<WindowRecord> = ids
                .iter()
                .filter_map(|id| windows.get(id))
                .filter_map(|w| match w.recordable_workspace() {
                    Some(ws) => Some(record_for(w, owners.get(&w.id), ws, w.floating, now)),
                    None => {
                        debug!(
                            "Window {} is on workspace {:?}, placement not recorded",
                            w.id, w.workspace_name
                        );
                        None
                    }
                })
                .collect();
            if let Err(e) = store.upsert_batch(records).await {
                warn!("Failed to persist placements before hiding: {}", e);
            }
        }

        let batch: Vec<ManagerCommand> = ids
            .iter()
            .flat_map(|&id| {
                let mark = hidden_mark_for(&self.settings.hidden_mark, id);
                [
                    ManagerCommand::new(id, CommandOp::Mark(mark)),
                    ManagerCommand::new(id, CommandOp::MoveToScratchpad),
                ]
            })
            .collect();
        let outcomes = self.manager.run_commands(&batch).await?;

        for (index, id) in ids.iter().enumerate() {
            match window_failure(&outcomes, index, HIDE_OPS) {
                None => result.hidden.push(*id),
                Some(message) => {
                    warn!("Failed to hide window {}: {}", id, message);
                    result
                        .errors
                        .push(WindowError::failed(*id, Operation::Hide, message));
                }
            }
        }
        Ok(())
    }

    async fn restore(
        &self,
        ids: &[WindowId],
        windows: &HashMap<WindowId, &WindowSnapshot>,
        owners: &HashMap<WindowId, WindowOwner>,
        result: &mut FilterResult,
    ) -> Result<(), FilterError> {
        let live: Option<HashSet<i32>> = match self.settings.validation {
            WorkspaceValidation::Live => Some(
                self.manager
                    .query_workspaces()
                    .await?
                    .into_iter()
                    .map(|w| w.num)
                    .collect(),
            ),
            WorkspaceValidation::Range => None,
        };

        let targets: Vec<RestoreTarget> = {
            let store = self.store.lock().await;
            ids.iter()
                .map(|&id| {
                    let (target, note) = resolve_target(
                        id,
                        store.get(id),
                        live.as_ref(),
                        self.settings.fallback_workspace,
                    );
                    if let Some(note) = note {
                        debug!("Window {}: {}", id, note);
                        result.errors.push(WindowError::note(id, Operation::Restore, note));
                    }
                    target
                })
                .collect()
        };

        let batch: Vec<ManagerCommand> = targets
            .iter()
            .flat_map(|t| {
                let mark = hidden_mark_for(&self.settings.hidden_mark, t.window_id);
                [
                    ManagerCommand::new(t.window_id, CommandOp::Unmark(mark)),
                    ManagerCommand::new(t.window_id, CommandOp::MoveToWorkspace(t.workspace)),
                    ManagerCommand::new(t.window_id, CommandOp::SetFloating(t.floating)),
                ]
            })
            .collect();
        let outcomes = self.manager.run_commands(&batch).await?;

        let mut restored = Vec::new();
        {
            let store = self.store.lock().await;
            let now = store.now();
            for (index, target) in targets.iter().enumerate() {
                let id = target.window_id;
                if let Some(message) = window_failure(&outcomes, index, RESTORE_OPS) {
                    warn!("Failed to restore window {}: {}", id, message);
                    result
                        .errors
                        .push(WindowError::failed(id, Operation::Restore, message));
                    continue;
                }
                result.restored.push(id);
                let record = match windows.get(&id) {
                    Some(w) => record_for(w, owners.get(&id), target.workspace, target.floating, now),
                    None => WindowRecord {
                        window_id: id,
                        workspace_number: target.workspace,
                        floating: target.floating,
                        project_name: String::new(),
                        app_name: String::new(),
                        window_class: String::new(),
                        last_seen: now,
                    },
                };
                restored.push(record);
            }
        }

        if let Err(e) = self.store.lock().await.upsert_batch(restored).await {
            warn!("Failed to persist restored placements: {}", e);
        }
        Ok(())
    }

    /// The currently active project, empty when none was ever chosen.
    pub async fn active_project(&self) -> String {
        self.store
            .lock()
            .await
            .active_project()
            .unwrap_or_default()
            .to_string()
    }

    /// Windows hidden by this daemon, grouped by owning project.
    pub async fn hidden_windows(&self, project: Option<&str>) -> Result<HiddenListing, FilterError> {
        let windows = self.manager.query_tree().await?;
        let hidden: Vec<WindowSnapshot> = windows
            .into_iter()
            .filter(|w| w.is_hidden_by(&self.settings.hidden_mark))
            .collect();
        let owners = self.classifier.owners(&hidden).await;

        let store = self.store.lock().await;
        let mut groups: BTreeMap<String, Vec<HiddenWindow>> = BTreeMap::new();
        for window in &hidden {
            let record = store.get(window.id);
            let owner_project = owners
                .get(&window.id)
                .and_then(|o| o.ownership.project())
                .map(str::to_string)
                .or_else(|| record.map(|r| r.project_name.clone()))
                .unwrap_or_default();
            if project.is_some_and(|p| p != owner_project) {
                continue;
            }
            groups.entry(owner_project).or_default().push(HiddenWindow {
                window_id: window.id,
                app_name: owners
                    .get(&window.id)
                    .and_then(|o| o.app_name.clone())
                    .or_else(|| record.map(|r| r.app_name.clone()))
                    .unwrap_or_default(),
                window_class: window.class.clone(),
                title: window.title.clone(),
                workspace_number: record.map(|r| r.workspace_number),
                floating: record.is_some_and(|r| r.floating),
            });
        }

        let total = groups.values().map(Vec::len).sum();
        Ok(HiddenListing {
            total,
            groups: groups
                .into_iter()
                .map(|(project, windows)| HiddenGroup { project, windows })
                .collect(),
        })
    }

    /// Stored and live view of one window. `None` if the daemon knows
    /// nothing about it.
    pub async fn window_state(&self, window_id: WindowId) -> Result<Option<WindowState>, FilterError> {
        let live = self
            .manager
            .query_tree()
            .await?
            .into_iter()
            .find(|w| w.id == window_id);

        let (record, active_project) = {
            let store = self.store.lock().await;
            (
                store.get(window_id).cloned(),
                store.active_project().unwrap_or_default().to_string(),
            )
        };
        if live.is_none() && record.is_none() {
            return Ok(None);
        }

        let ownership = match &live {
            Some(w) => self.classifier.owner_of(w.pid).await.ownership,
            None => match &record {
                Some(r) if !r.is_global() => Ownership::Scoped(r.project_name.clone()),
                _ => Ownership::Unknown,
            },
        };
        let verdict = classify(&ownership, &active_project);
        let hidden = live
            .as_ref()
            .is_some_and(|w| w.is_hidden_by(&self.settings.hidden_mark));

        Ok(Some(WindowState {
            window_id,
            active_project,
            record,
            live,
            ownership,
            verdict,
            hidden,
        }))
    }
}

/// Pick the workspace a hidden window returns to.
///
/// Returns the target and, when the fallback was used, a note explaining why.
fn resolve_target(
    window_id: WindowId,
    record: Option<&WindowRecord>,
    live: Option<&HashSet<i32>>,
    fallback: i32,
) -> (RestoreTarget, Option<String>) {
    match record {
        Some(r) if live.map_or(true, |l| l.contains(&r.workspace_number)) => (
            RestoreTarget {
                window_id,
                workspace: r.workspace_number,
                floating: r.floating,
            },
            None,
        ),
        Some(r) => (
            RestoreTarget {
                window_id,
                workspace: fallback,
                floating: r.floating,
            },
            Some(format!(
                "workspace {} no longer exists, restored to workspace {}",
                r.workspace_number, fallback
            )),
        ),
        None => (
            RestoreTarget {
                window_id,
                workspace: fallback,
                floating: false,
            },
            Some(format!(
                "no recorded workspace, restored to workspace {}",
                fallback
            )),
        ),
    }
}

/// Failure message for the `index`-th window of a batch of `ops` sub-commands
/// per window. Missing replies count as failures.
fn window_failure(outcomes: &[CommandOutcome], index: usize, ops: usize) -> Option<String> {
    let start = index * ops;
    match outcomes.get(start..start + ops) {
        Some(chunk) => first_failure(chunk),
        None => Some("no reply from window manager".to_string()),
    }
}

fn first_failure(outcomes: &[CommandOutcome]) -> Option<String> {
    outcomes
        .iter()
        .find(|o| !o.success)
        .map(|o| o.error.clone().unwrap_or_else(|| "command failed".to_string()))
}

/// A record for `window` at `workspace`.
pub(crate) fn record_for(
    window: &WindowSnapshot,
    owner: Option<&WindowOwner>,
    workspace: i32,
    floating: bool,
    now: u64,
) -> WindowRecord {
    WindowRecord {
        window_id: window.id,
        workspace_number: workspace,
        floating,
        project_name: owner
            .map(|o| o.ownership.record_project())
            .unwrap_or_default(),
        app_name: owner.and_then(|o| o.app_name.clone()).unwrap_or_default(),
        window_class: window.class.clone(),
        last_seen: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ws: i32, floating: bool) -> WindowRecord {
        WindowRecord {
            window_id: 1,
            workspace_number: ws,
            floating,
            project_name: "a".to_string(),
            app_name: String::new(),
            window_class: String::new(),
            last_seen: 0,
        }
    }

    #[test]
    fn test_resolve_target_uses_live_workspace() {
        let live: HashSet<i32> = [1, 4].into_iter().collect();
        let r = record(4, true);
        let (target, note) = resolve_target(1, Some(&r), Some(&live), 1);
        assert_eq!(target.workspace, 4);
        assert!(target.floating);
        assert!(note.is_none());
    }

    #[test]
    fn test_resolve_target_falls_back_when_workspace_gone() {
        let live: HashSet<i32> = [1].into_iter().collect();
        let r = record(7, true);
        let (target, note) = resolve_target(1, Some(&r), Some(&live), 2);
        assert_eq!(target.workspace, 2);
        assert!(target.floating);
        assert!(note.unwrap().contains("workspace 7"));
    }

    #[test]
    fn test_resolve_target_without_record() {
        let (target, note) = resolve_target(9, None, None, 3);
        assert_eq!(target.workspace, 3);
        assert!(!target.floating);
        assert!(note.is_some());
    }

    #[test]
    fn test_range_validation_trusts_record() {
        let r = record(42, false);
        let (target, note) = resolve_target(1, Some(&r), None, 1);
        assert_eq!(target.workspace, 42);
        assert!(note.is_none());
    }

    #[test]
    fn test_first_failure() {
        assert_eq!(first_failure(&[CommandOutcome::ok(), CommandOutcome::ok()]), None);
        assert_eq!(
            first_failure(&[CommandOutcome::ok(), CommandOutcome::failed("No window matches")]),
            Some("No window matches".to_string())
        );
        assert_eq!(
            first_failure(&[CommandOutcome {
                success: false,
                error: None
            }]),
            Some("command failed".to_string())
        );
    }

    #[test]
    fn test_window_failure_maps_chunks() {
        let outcomes = vec![
            CommandOutcome::ok(),
            CommandOutcome::ok(),
            CommandOutcome::ok(),
            CommandOutcome::failed("gone"),
        ];
        assert_eq!(window_failure(&outcomes, 0, HIDE_OPS), None);
        assert_eq!(window_failure(&outcomes, 1, HIDE_OPS), Some("gone".to_string()));
        assert!(window_failure(&outcomes, 2, HIDE_OPS).is_some());
    }
}
