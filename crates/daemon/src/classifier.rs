//! Resolving window ownership from process environments.
//!
//! Lookup failures never hide a window: a window whose process is gone or
//! unreadable is treated as unknown ownership, which classifies as visible.

use i3pm_core::{classify, EnvError, EnvironmentSource, Verdict, WindowId, WindowOwner, WindowSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Reads launch metadata for windows.
pub struct Classifier<E> {
    env: Arc<E>,
}

impl<E> Clone for Classifier<E> {
    fn clone(&self) -> Self {
        Self {
            env: Arc::clone(&self.env),
        }
    }
}

impl<E: EnvironmentSource> Classifier<E> {
    pub fn new(env: Arc<E>) -> Self {
        Self { env }
    }

    /// Owner of the process `pid`, or unknown when it cannot be read.
    pub async fn owner_of(&self, pid: Option<u32>) -> WindowOwner {
        lookup_owner(&*self.env, pid).await
    }

    /// Classify one window against the active project.
    pub async fn classify(&self, window: &WindowSnapshot, active_project: &str) -> Verdict {
        let owner = self.owner_of(window.pid).await;
        classify(&owner.ownership, active_project)
    }

    /// Owners of every window, read concurrently.
    pub async fn owners(&self, windows: &[WindowSnapshot]) -> HashMap<WindowId, WindowOwner> {
        let mut owners = HashMap::with_capacity(windows.len());
        let mut reads = JoinSet::new();

        for window in windows {
            let Some(pid) = window.pid else {
                debug!("Window {} has no pid, ownership unknown", window.id);
                owners.insert(window.id, WindowOwner::unknown());
                continue;
            };
            let env = Arc::clone(&self.env);
            let id = window.id;
            reads.spawn(async move { (id, lookup_owner(&*env, Some(pid)).await) });
        }

        while let Some(joined) = reads.join_next().await {
            match joined {
                Ok((id, owner)) => {
                    owners.insert(id, owner);
                }
                Err(e) => warn!("Environment read task failed: {}", e),
            }
        }

        // A failed task leaves its window out; treat it like any unreadable window.
        for window in windows {
            owners.entry(window.id).or_insert_with(WindowOwner::unknown);
        }
        owners
    }
}

async fn lookup_owner<E: EnvironmentSource>(env: &E, pid: Option<u32>) -> WindowOwner {
    let Some(pid) = pid else {
        return WindowOwner::unknown();
    };
    match env.read_environment(pid).await {
        Ok(vars) => WindowOwner::from_environment(&vars),
        Err(EnvError::ProcessNotFound(pid)) => {
            debug!("Process {} is gone, treating its window as unowned", pid);
            WindowOwner::unknown()
        }
        Err(e) => {
            debug!("{}, treating window as unowned", e);
            WindowOwner::unknown()
        }
    }
}
