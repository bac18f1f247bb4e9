//! i3pm Platform (i3 / sway)
//!
//! Talks to the window manager and the operating system.
//!
//! This crate handles:
//! - The i3 IPC wire format shared by i3 and sway
//! - Tree, workspace and command queries over one persistent connection
//! - Event subscriptions on a dedicated connection
//! - Reading process environments from procfs

pub mod client;
pub mod environ;
pub mod protocol;
pub mod tree;

use i3pm_core::ManagerError;
use std::path::PathBuf;
use thiserror::Error;

pub use client::{socket_path_from_env, RetryPolicy, SwayClient};
pub use environ::ProcEnvironment;
pub use protocol::EventKind;

/// Errors that can occur talking to i3/sway.
#[derive(Debug, Error)]
pub enum SwayError {
    #[error("Neither SWAYSOCK nor I3SOCK is set")]
    NoSocket,

    #[error("Failed to connect to {}: {source}", .path.display())]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid JSON from window manager: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<SwayError> for ManagerError {
    fn from(e: SwayError) -> Self {
        match e {
            SwayError::NoSocket | SwayError::Connect { .. } => ManagerError::Connection(e.to_string()),
            SwayError::Io(_) => ManagerError::Io(e.to_string()),
            SwayError::Json(_) | SwayError::Protocol(_) => ManagerError::Protocol(e.to_string()),
        }
    }
}
