//! i3pm RPC Protocol
//!
//! Shared types for daemon-client communication over a Unix socket.
//!
//! The protocol is newline-delimited JSON. Clients send [`RpcRequest`]s; the
//! daemon answers each one with a [`ServerMessage::Response`] or
//! [`ServerMessage::Error`] carrying the same id, and pushes
//! [`ServerMessage::Notification`]s to every connected client whenever a
//! filtering operation completes.

use i3pm_core::{
    FilterMode, FilterResult, Ownership, Verdict, WindowId, WindowRecord, WindowSnapshot,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Maximum size of a single request line.
pub const MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024;

/// Socket file name inside the runtime directory.
pub const SOCKET_NAME: &str = "daemon.sock";

/// Default socket path: `$XDG_RUNTIME_DIR/i3pm/daemon.sock`.
pub fn default_socket_path() -> PathBuf {
    let runtime = std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    runtime.join("i3pm").join(SOCKET_NAME)
}

/// Methods a client can call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum RpcCall {
    /// Hide every visible window owned by `project`.
    HideWindows { project: String },
    /// Restore every window of `project` hidden by the daemon.
    RestoreWindows { project: String },
    /// Switch the active project, hiding and restoring as needed.
    SwitchWithFiltering { project: String },
    /// List hidden windows grouped by project, optionally for one project.
    GetHidden {
        #[serde(default)]
        project: Option<String>,
    },
    /// Stored record and live classification of one window.
    GetState { window_id: WindowId },
    /// The currently active project.
    GetActiveProject,
    /// Liveness check.
    Ping,
}

impl RpcCall {
    /// Wire name of the method.
    pub fn method_name(&self) -> &'static str {
        match self {
            RpcCall::HideWindows { .. } => "hideWindows",
            RpcCall::RestoreWindows { .. } => "restoreWindows",
            RpcCall::SwitchWithFiltering { .. } => "switchWithFiltering",
            RpcCall::GetHidden { .. } => "getHidden",
            RpcCall::GetState { .. } => "getState",
            RpcCall::GetActiveProject => "getActiveProject",
            RpcCall::Ping => "ping",
        }
    }
}

/// A request line: `{"id": 1, "method": "...", ...params}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    #[serde(flatten)]
    pub call: RpcCall,
}

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorCode {
    InvalidRequest,
    UnknownProject,
    NotFound,
    ManagerUnavailable,
    ShuttingDown,
    Internal,
}

impl RpcErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcErrorCode::InvalidRequest => "invalid_request",
            RpcErrorCode::UnknownProject => "unknown_project",
            RpcErrorCode::NotFound => "not_found",
            RpcErrorCode::ManagerUnavailable => "manager_unavailable",
            RpcErrorCode::ShuttingDown => "shutting_down",
            RpcErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured error returned to a client.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A hidden window in a [`HiddenListing`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenWindow {
    pub window_id: WindowId,
    pub app_name: String,
    pub window_class: String,
    pub title: String,
    /// Workspace the window will be restored to, if recorded.
    pub workspace_number: Option<i32>,
    pub floating: bool,
}

/// Hidden windows of one project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenGroup {
    /// Owning project; empty for windows with unknown ownership.
    pub project: String,
    pub windows: Vec<HiddenWindow>,
}

/// Result of `getHidden`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenListing {
    pub total: usize,
    pub groups: Vec<HiddenGroup>,
}

/// Result of `getState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowState {
    pub window_id: WindowId,
    pub active_project: String,
    /// Persisted record, if the window is tracked.
    pub record: Option<WindowRecord>,
    /// Live view from a fresh tree query, if the window still exists.
    pub live: Option<WindowSnapshot>,
    pub ownership: Ownership,
    /// Classification against the active project.
    pub verdict: Verdict,
    /// Whether the daemon currently hides the window.
    pub hidden: bool,
}

/// Successful result payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcResult {
    Filter(FilterResult),
    Hidden(HiddenListing),
    State(WindowState),
    ActiveProject { project: String },
    Pong { version: String },
}

/// Compact summary broadcast after each filtering operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSummary {
    pub project: String,
    pub mode: FilterMode,
    pub hidden_count: usize,
    pub restored_count: usize,
    pub error_count: usize,
    pub duration_ms: u64,
}

impl From<&FilterResult> for FilterSummary {
    fn from(result: &FilterResult) -> Self {
        Self {
            project: result.project.clone(),
            mode: result.mode,
            hidden_count: result.hidden_count,
            restored_count: result.restored_count,
            error_count: result.errors.len(),
            duration_ms: result.duration_ms,
        }
    }
}

/// Notification event name for a filtering mode.
pub fn event_name(mode: FilterMode) -> &'static str {
    match mode {
        FilterMode::Switch => "project_switched",
        FilterMode::Hide => "windows_hidden",
        FilterMode::Restore => "windows_restored",
    }
}

/// Everything the daemon writes to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Response { id: u64, result: RpcResult },
    Error { id: u64, error: RpcError },
    Notification { event: String, summary: FilterSummary },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(id: u64, code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            error: RpcError::new(code, message),
        }
    }

    /// Notification for a completed filtering operation.
    pub fn notification(result: &FilterResult) -> Self {
        Self::Notification {
            event: event_name(result.mode).to_string(),
            summary: FilterSummary::from(result),
        }
    }

    /// Serialize as one protocol line, newline included.
    pub fn to_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => json + "\n",
            Err(_) => "{\"type\":\"error\",\"id\":0,\"error\":{\"code\":\"internal\",\"message\":\"Internal serialization error\"}}\n".to_string(),
        }
    }
}
