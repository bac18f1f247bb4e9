//! i3pm Core
//!
//! Platform-agnostic model for project-scoped window filtering.
//!
//! This crate holds everything that can be decided without talking to the
//! window manager or the operating system:
//! - Window records, filter results and per-window errors
//! - Ownership parsing and visibility classification
//! - Partitioning a tree snapshot into hide/restore sets
//! - The manager and environment traits the daemon is generic over

pub mod ownership;
pub mod plan;
pub mod traits;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub use ownership::{classify, Ownership, Verdict, WindowOwner};
pub use plan::{plan_switch, Placement, SwitchPlan};
pub use traits::{
    CommandOp, CommandOutcome, EnvError, EnvironmentSource, EventWindow, ManagerCommand,
    ManagerError, ManagerEvent, WindowChange, WindowManager,
};

/// Unique identifier for a window.
/// This is the manager's container id, stable for the lifetime of the window.
pub type WindowId = u64;

/// Lowest workspace number a record may carry.
pub const MIN_WORKSPACE: i32 = 1;

/// Highest workspace number a record may carry.
pub const MAX_WORKSPACE: i32 = 70;

/// Workspace used when a remembered workspace can no longer be used.
pub const DEFAULT_FALLBACK_WORKSPACE: i32 = 1;

/// Mark placed on window `window_id` while it is hidden.
///
/// i3 and sway allow a mark on only one container at a time, so every hidden
/// window carries its own `<prefix>:<id>` mark.
pub fn hidden_mark_for(prefix: &str, window_id: WindowId) -> String {
    format!("{}:{}", prefix, window_id)
}

/// Whether `num` is a workspace number the store accepts.
pub fn is_valid_workspace(num: i32) -> bool {
    (MIN_WORKSPACE..=MAX_WORKSPACE).contains(&num)
}

/// Durable placement record for one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRecord {
    /// The window identifier.
    pub window_id: WindowId,
    /// Last known workspace number (1-70).
    pub workspace_number: i32,
    /// Whether the window was floating.
    pub floating: bool,
    /// Owning project; empty means global.
    #[serde(default)]
    pub project_name: String,
    /// Application name from the launch metadata, if any.
    #[serde(default)]
    pub app_name: String,
    /// Window class (X11 class or Wayland app_id).
    #[serde(default)]
    pub window_class: String,
    /// Unix seconds when the window was last observed.
    pub last_seen: u64,
}

impl WindowRecord {
    /// True when the record does not belong to any project.
    pub fn is_global(&self) -> bool {
        self.project_name.is_empty()
    }
}

/// Which half of a filtering operation a window error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Hide,
    Restore,
}

/// A failure (or fallback note) for a single window during filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowError {
    pub window_id: WindowId,
    pub operation: Operation,
    pub message: String,
    /// Recoverable errors did not prevent the window from ending up in a
    /// usable state (e.g. restored onto the fallback workspace).
    pub recoverable: bool,
}

impl WindowError {
    /// A hard failure: the window was left where it was.
    pub fn failed(window_id: WindowId, operation: Operation, message: impl Into<String>) -> Self {
        Self {
            window_id,
            operation,
            message: message.into(),
            recoverable: false,
        }
    }

    /// A note about a window that was still handled.
    pub fn note(window_id: WindowId, operation: Operation, message: impl Into<String>) -> Self {
        Self {
            window_id,
            operation,
            message: message.into(),
            recoverable: true,
        }
    }
}

/// Kind of filtering operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Hide everything not visible under the target and restore the rest.
    Switch,
    /// Only hide windows owned by the target project.
    Hide,
    /// Only restore windows owned by the target project.
    Restore,
}

/// Outcome of one filtering operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterResult {
    /// Project the operation targeted.
    pub project: String,
    pub mode: FilterMode,
    pub hidden_count: usize,
    pub restored_count: usize,
    /// Windows that were successfully hidden.
    #[serde(default)]
    pub hidden: Vec<WindowId>,
    /// Windows that were successfully restored.
    #[serde(default)]
    pub restored: Vec<WindowId>,
    #[serde(default)]
    pub errors: Vec<WindowError>,
    /// Wall time of the whole operation in milliseconds.
    pub duration_ms: u64,
}

impl FilterResult {
    /// An empty result for `project`.
    pub fn empty(project: impl Into<String>, mode: FilterMode) -> Self {
        Self {
            project: project.into(),
            mode,
            hidden_count: 0,
            restored_count: 0,
            hidden: Vec::new(),
            restored: Vec::new(),
            errors: Vec::new(),
            duration_ms: 0,
        }
    }

    /// True when nothing was hidden or restored.
    pub fn is_noop(&self) -> bool {
        self.hidden_count == 0 && self.restored_count == 0
    }

    /// Number of errors that left a window unhandled.
    pub fn hard_error_count(&self) -> usize {
        self.errors.iter().filter(|e| !e.recoverable).count()
    }
}

/// A queued request to run a filtering operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRequest {
    pub target_project: String,
    pub mode: FilterMode,
    /// Unix seconds at enqueue time.
    pub enqueue_time: u64,
}

/// One window from a fresh tree query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub id: WindowId,
    /// Owning process, when the manager reports it.
    pub pid: Option<u32>,
    /// X11 class or Wayland app_id.
    pub class: String,
    pub title: String,
    /// Number of the containing workspace; `None` for named-only workspaces
    /// and the scratchpad.
    pub workspace_num: Option<i32>,
    pub workspace_name: Option<String>,
    pub floating: bool,
    /// Whether the window currently sits in the scratchpad.
    pub scratchpad: bool,
    pub marks: Vec<String>,
}

impl WindowSnapshot {
    /// Whether this daemon hid the window: it sits in the scratchpad and
    /// carries the per-window mark built from `mark_prefix`.
    pub fn is_hidden_by(&self, mark_prefix: &str) -> bool {
        if !self.scratchpad {
            return false;
        }
        let mark = hidden_mark_for(mark_prefix, self.id);
        self.marks.iter().any(|m| *m == mark)
    }

    /// The workspace number if it is one the store can remember.
    pub fn recordable_workspace(&self) -> Option<i32> {
        self.workspace_num.filter(|n| is_valid_workspace(*n))
    }
}

/// A workspace as reported by the manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceInfo {
    pub num: i32,
    pub name: String,
    pub output: String,
    pub visible: bool,
    pub focused: bool,
}

/// Scope of an application in the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppScope {
    /// Windows follow the owning project.
    Scoped,
    /// Windows stay visible in every project.
    #[default]
    Global,
}

/// An application entry from the external registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationDescriptor {
    pub name: String,
    #[serde(default)]
    pub scope: AppScope,
    #[serde(default)]
    pub preferred_workspace: Option<i32>,
    /// Regex matched against the window class when launch metadata is missing.
    #[serde(default)]
    pub expected_class: Option<String>,
}

/// A project definition from the external catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub name: String,
    pub directory: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub icon: String,
}

/// Source of wall-clock time in unix seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn advance(&self, secs: u64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, secs: u64) {
        self.0.store(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(id: WindowId) -> WindowSnapshot {
        WindowSnapshot {
            id,
            pid: Some(100),
            class: "Alacritty".to_string(),
            title: "shell".to_string(),
            workspace_num: Some(3),
            workspace_name: Some("3".to_string()),
            floating: false,
            scratchpad: false,
            marks: Vec::new(),
        }
    }

    #[test]
    fn test_workspace_bounds() {
        assert!(!is_valid_workspace(0));
        assert!(is_valid_workspace(1));
        assert!(is_valid_workspace(70));
        assert!(!is_valid_workspace(71));
        assert!(!is_valid_workspace(-1));
    }

    #[test]
    fn test_hidden_requires_scratchpad_and_mark() {
        let mut w = snapshot(1);
        w.marks.push("_i3pm_hidden:1".to_string());
        assert!(!w.is_hidden_by("_i3pm_hidden"));

        w.scratchpad = true;
        assert!(w.is_hidden_by("_i3pm_hidden"));
        assert!(!w.is_hidden_by("other"));
    }

    #[test]
    fn test_hidden_mark_is_per_window() {
        assert_eq!(hidden_mark_for("_i3pm_hidden", 42), "_i3pm_hidden:42");

        // The bare prefix or another window's mark does not count.
        let mut w = snapshot(7);
        w.scratchpad = true;
        w.marks = vec!["_i3pm_hidden".to_string(), "_i3pm_hidden:8".to_string()];
        assert!(!w.is_hidden_by("_i3pm_hidden"));

        w.marks.push(hidden_mark_for("_i3pm_hidden", 7));
        assert!(w.is_hidden_by("_i3pm_hidden"));
    }

    #[test]
    fn test_recordable_workspace_rejects_named_and_out_of_range() {
        let mut w = snapshot(1);
        assert_eq!(w.recordable_workspace(), Some(3));

        w.workspace_num = Some(-1);
        assert_eq!(w.recordable_workspace(), None);

        w.workspace_num = None;
        assert_eq!(w.recordable_workspace(), None);
    }

    #[test]
    fn test_filter_result_counts() {
        let mut result = FilterResult::empty("alpha", FilterMode::Switch);
        assert!(result.is_noop());

        result.hidden_count = 1;
        result.errors.push(WindowError::note(4, Operation::Restore, "fallback"));
        result.errors.push(WindowError::failed(5, Operation::Hide, "boom"));
        assert!(!result.is_noop());
        assert_eq!(result.hard_error_count(), 1);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);
        clock.advance(5);
        assert_eq!(clock.now(), 1_005);
        clock.set(7);
        assert_eq!(clock.now(), 7);
    }

    #[test]
    fn test_descriptor_defaults() {
        let app: ApplicationDescriptor = serde_json::from_str(r#"{"name":"firefox"}"#).unwrap();
        assert_eq!(app.scope, AppScope::Global);
        assert!(app.preferred_workspace.is_none());
        assert!(app.expected_class.is_none());
    }

    #[test]
    fn test_record_is_global() {
        let record = WindowRecord {
            window_id: 1,
            workspace_number: 2,
            floating: false,
            project_name: String::new(),
            app_name: "firefox".to_string(),
            window_class: "firefox".to_string(),
            last_seen: 0,
        };
        assert!(record.is_global());
    }
}
