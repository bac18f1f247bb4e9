//! Process environment reader backed by `/proc/<pid>/environ`.

use i3pm_core::{EnvError, EnvironmentSource};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::trace;

/// `ESRCH`, returned when reading the environ of a process that just exited.
const ESRCH: i32 = 3;

/// Reads environments through procfs.
#[derive(Debug, Clone)]
pub struct ProcEnvironment {
    root: PathBuf,
}

impl Default for ProcEnvironment {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl ProcEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different procfs root (tests, containers).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn environ_path(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string()).join("environ")
    }
}

/// Parse the NUL-separated `KEY=VALUE` blob of an environ file.
///
/// Entries that are not UTF-8, have no `=`, or have an empty key are skipped.
pub fn parse_environ(bytes: &[u8]) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for entry in bytes.split(|b| *b == 0) {
        if entry.is_empty() {
            continue;
        }
        let Ok(text) = std::str::from_utf8(entry) else {
            trace!("Skipping non-UTF-8 environment entry");
            continue;
        };
        match text.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                env.insert(key.to_string(), value.to_string());
            }
            _ => trace!("Skipping malformed environment entry"),
        }
    }
    env
}

impl EnvironmentSource for ProcEnvironment {
    async fn read_environment(&self, pid: u32) -> Result<HashMap<String, String>, EnvError> {
        match tokio::fs::read(self.environ_path(pid)).await {
            Ok(bytes) => Ok(parse_environ(&bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound || e.raw_os_error() == Some(ESRCH) => {
                Err(EnvError::ProcessNotFound(pid))
            }
            Err(e) => Err(EnvError::Unreadable {
                pid,
                message: e.to_string(),
            }),
        }
    }
}
