//! Seams between the filtering logic and the outside world.
//!
//! The daemon is generic over [`WindowManager`] and [`EnvironmentSource`] so
//! the filtering engine can run against a live compositor or an in-memory
//! double in tests.

use crate::{WindowId, WindowSnapshot, WorkspaceInfo};
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;

/// Errors talking to the window manager.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ManagerError {
    #[error("Window manager unreachable: {0}")]
    Connection(String),

    #[error("Window manager protocol error: {0}")]
    Protocol(String),

    #[error("Window manager I/O error: {0}")]
    Io(String),
}

/// Errors reading a process environment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvError {
    /// The process is gone.
    #[error("Process not found: {0}")]
    ProcessNotFound(u32),

    /// The manager did not report an owning process for the window.
    #[error("Window has no owning process id")]
    NoProcessId,

    #[error("Failed to read environment of process {pid}: {message}")]
    Unreadable { pid: u32, message: String },
}

/// A single operation on one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOp {
    /// Add a mark to the window.
    Mark(String),
    /// Remove a mark from the window.
    Unmark(String),
    /// Send the window to the scratchpad.
    MoveToScratchpad,
    /// Move the window to a numbered workspace.
    MoveToWorkspace(i32),
    /// Enable or disable floating.
    SetFloating(bool),
}

/// A sub-command of a batch, addressed to one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerCommand {
    pub window_id: WindowId,
    pub op: CommandOp,
}

impl ManagerCommand {
    pub fn new(window_id: WindowId, op: CommandOp) -> Self {
        Self { window_id, op }
    }
}

/// Result of one sub-command in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

/// What happened to a window in a window event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowChange {
    New,
    Close,
    Focus,
    Title,
    FullscreenMode,
    Move,
    Floating,
    Urgent,
    Mark,
    Other,
}

impl WindowChange {
    /// Parse the `change` field of a window event.
    pub fn parse(change: &str) -> Self {
        match change {
            "new" => Self::New,
            "close" => Self::Close,
            "focus" => Self::Focus,
            "title" => Self::Title,
            "fullscreen_mode" => Self::FullscreenMode,
            "move" => Self::Move,
            "floating" => Self::Floating,
            "urgent" => Self::Urgent,
            "mark" => Self::Mark,
            _ => Self::Other,
        }
    }
}

/// The container carried by a window event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventWindow {
    pub id: WindowId,
    pub pid: Option<u32>,
    pub class: String,
}

/// An event from the manager's subscription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    Window {
        change: WindowChange,
        window: EventWindow,
    },
    Workspace {
        change: String,
    },
    Output {
        change: String,
    },
    /// Application-defined marker sent with `send_tick`.
    Tick {
        payload: String,
        /// Set on the tick the manager sends right after subscribing.
        first: bool,
    },
    /// The manager is exiting or restarting.
    Shutdown {
        change: String,
    },
}

/// Queries and commands the filtering engine needs from a window manager.
///
/// Every call is a fresh round trip; implementations must not cache.
pub trait WindowManager: Send + Sync + 'static {
    /// All managed windows in the current tree.
    fn query_tree(&self) -> impl Future<Output = Result<Vec<WindowSnapshot>, ManagerError>> + Send;

    /// Workspaces that currently exist.
    fn query_workspaces(
        &self,
    ) -> impl Future<Output = Result<Vec<WorkspaceInfo>, ManagerError>> + Send;

    /// Run all sub-commands in one round trip, returning one outcome per
    /// sub-command in order.
    fn run_commands(
        &self,
        batch: &[ManagerCommand],
    ) -> impl Future<Output = Result<Vec<CommandOutcome>, ManagerError>> + Send;
}

/// Read access to process environments.
pub trait EnvironmentSource: Send + Sync + 'static {
    /// Environment variables of process `pid`.
    fn read_environment(
        &self,
        pid: u32,
    ) -> impl Future<Output = Result<HashMap<String, String>, EnvError>> + Send;
}
