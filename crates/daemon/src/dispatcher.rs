//! Turning window manager events into store updates and queued switches.
//!
//! [`decide`] and [`new_window_target`] are pure; [`Dispatcher::handle`]
//! performs the lookups and side effects they call for.

use crate::classifier::Classifier;
use crate::filter::record_for;
use crate::queue::SwitchQueue;
use crate::registry::AppRegistry;
use crate::store::SharedStore;
use i3pm_core::{
    is_valid_workspace, ApplicationDescriptor, CommandOp, EnvironmentSource, EventWindow,
    ManagerCommand, ManagerEvent, WindowChange, WindowId, WindowManager, WindowOwner,
    WindowRecord, WindowSnapshot,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do about one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do.
    Ignore,
    /// A new window appeared; resolve its application and place it.
    PlaceNew(EventWindow),
    /// The window moved or changed floating state; record where it is now.
    RecordPlacement(WindowId),
    /// The window closed.
    Forget(WindowId),
    /// Switch to the named project.
    Switch(String),
    /// Outputs changed.
    OutputsChanged(String),
    /// Stop the daemon.
    Shutdown(String),
}

/// Whether the event loop keeps going after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Decide what an event calls for.
pub fn decide(event: &ManagerEvent, tick_prefix: &str) -> Action {
    match event {
        ManagerEvent::Window { change, window } => match change {
            WindowChange::New => Action::PlaceNew(window.clone()),
            WindowChange::Move | WindowChange::Floating => Action::RecordPlacement(window.id),
            WindowChange::Close => Action::Forget(window.id),
            _ => Action::Ignore,
        },
        ManagerEvent::Tick { payload, first } => {
            if *first {
                return Action::Ignore;
            }
            match payload.strip_prefix(tick_prefix) {
                Some(project) => Action::Switch(project.trim().to_string()),
                None => Action::Ignore,
            }
        }
        ManagerEvent::Output { change } => Action::OutputsChanged(change.clone()),
        ManagerEvent::Shutdown { change } => Action::Shutdown(change.clone()),
        ManagerEvent::Workspace { .. } => Action::Ignore,
    }
}

/// Workspace a new window should be moved to, if any.
pub fn new_window_target(app: Option<&ApplicationDescriptor>, current: Option<i32>) -> Option<i32> {
    let preferred = app?.preferred_workspace.filter(|ws| is_valid_workspace(*ws))?;
    if current == Some(preferred) {
        None
    } else {
        Some(preferred)
    }
}

/// Record for a window's current placement, or `None` if it cannot be
/// recorded (scratchpad, named-only or out-of-range workspace).
pub fn placement_record(
    window: &WindowSnapshot,
    owner: Option<&WindowOwner>,
    now: u64,
) -> Option<WindowRecord> {
    if window.scratchpad {
        return None;
    }
    let workspace = window.recordable_workspace()?;
    Some(record_for(window, owner, workspace, window.floating, now))
}

/// Dispatcher settings taken from configuration.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub tick_prefix: String,
    pub apply_preferred_workspace: bool,
}

pub struct Dispatcher<M, E> {
    manager: Arc<M>,
    classifier: Classifier<E>,
    store: SharedStore,
    registry: Arc<AppRegistry>,
    queue: SwitchQueue,
    settings: DispatchSettings,
}

impl<M: WindowManager, E: EnvironmentSource> Dispatcher<M, E> {
    pub fn new(
        manager: Arc<M>,
        env: Arc<E>,
        store: SharedStore,
        registry: Arc<AppRegistry>,
        queue: SwitchQueue,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            manager,
            classifier: Classifier::new(env),
            store,
            registry,
            queue,
            settings,
        }
    }

    /// Handle one event.
    pub async fn handle(&self, event: &ManagerEvent) -> Flow {
        match decide(event, &self.settings.tick_prefix) {
            Action::Ignore => {}
            Action::PlaceNew(window) => self.place_new(&window).await,
            Action::RecordPlacement(id) => self.record_placement(id).await,
            Action::Forget(id) => match self.store.lock().await.remove(id).await {
                Ok(Some(_)) => debug!("Forgot closed window {}", id),
                Ok(None) => {}
                Err(e) => warn!("Failed to remove record for window {}: {}", id, e),
            },
            Action::Switch(project) => {
                info!("Switch to '{}' requested by tick", project);
                if let Err(e) = self.queue.enqueue(project) {
                    warn!("Could not queue switch: {}", e);
                }
            }
            Action::OutputsChanged(change) => {
                // Redistributing workspaces across outputs is left to other tools.
                info!("Outputs changed ({})", change);
            }
            Action::Shutdown(change) => {
                info!("Window manager is shutting down ({})", change);
                return Flow::Shutdown;
            }
        }
        Flow::Continue
    }

    async fn lookup(&self, id: WindowId) -> Option<WindowSnapshot> {
        match self.manager.query_tree().await {
            Ok(windows) => windows.into_iter().find(|w| w.id == id),
            Err(e) => {
                warn!("Tree query for window {} failed: {}", id, e);
                None
            }
        }
    }

    async fn record_placement(&self, id: WindowId) {
        let Some(window) = self.lookup(id).await else {
            debug!("Window {} vanished before its move was recorded", id);
            return;
        };
        if window.scratchpad {
            debug!("Ignoring move of window {} into the scratchpad", id);
            return;
        }
        let owner = self.classifier.owner_of(window.pid).await;
        let mut store = self.store.lock().await;
        let Some(record) = placement_record(&window, Some(&owner), store.now()) else {
            debug!("Window {} is not on a numbered workspace", id);
            return;
        };
        debug!(
            "Window {} now on workspace {} (floating: {})",
            id, record.workspace_number, record.floating
        );
        if let Err(e) = store.upsert(record).await {
            warn!("Failed to record placement of window {}: {}", id, e);
        }
    }

    async fn place_new(&self, event_window: &EventWindow) {
        let Some(window) = self.lookup(event_window.id).await else {
            return;
        };
        let owner = self.classifier.owner_of(window.pid.or(event_window.pid)).await;
        let app = self.registry.resolve(owner.app_name.as_deref(), &window.class);
        if let Some(app) = app {
            debug!("Window {} resolved to application '{}'", window.id, app.name);
        }

        let mut placed = window.clone();
        if self.settings.apply_preferred_workspace && !window.scratchpad {
            if let Some(target) = new_window_target(app, window.workspace_num) {
                let command = ManagerCommand::new(window.id, CommandOp::MoveToWorkspace(target));
                match self.manager.run_commands(&[command]).await {
                    Ok(outcomes) if outcomes.first().is_some_and(|o| o.success) => {
                        info!("Moved new window {} to workspace {}", window.id, target);
                        placed.workspace_num = Some(target);
                    }
                    Ok(outcomes) => warn!(
                        "Failed to move window {} to workspace {}: {}",
                        window.id,
                        target,
                        outcomes
                            .first()
                            .and_then(|o| o.error.clone())
                            .unwrap_or_else(|| "no reply".to_string())
                    ),
                    Err(e) => warn!("Failed to move window {}: {}", window.id, e),
                }
            }
        }

        let mut owner = owner;
        if owner.app_name.is_none() {
            owner.app_name = app.map(|a| a.name.clone());
        }
        let mut store = self.store.lock().await;
        if let Some(record) = placement_record(&placed, Some(&owner), store.now()) {
            if let Err(e) = store.upsert(record).await {
                warn!("Failed to record new window {}: {}", window.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use i3pm_core::{AppScope, Ownership};

    fn event_window(id: WindowId) -> EventWindow {
        EventWindow {
            id,
            pid: Some(1),
            class: "Alacritty".to_string(),
        }
    }

    fn window_event(change: WindowChange, id: WindowId) -> ManagerEvent {
        ManagerEvent::Window {
            change,
            window: event_window(id),
        }
    }

    #[test]
    fn test_window_events() {
        assert_eq!(
            decide(&window_event(WindowChange::New, 1), "i3pm:switch:"),
            Action::PlaceNew(event_window(1))
        );
        assert_eq!(
            decide(&window_event(WindowChange::Move, 2), "i3pm:switch:"),
            Action::RecordPlacement(2)
        );
        assert_eq!(
            decide(&window_event(WindowChange::Floating, 3), "i3pm:switch:"),
            Action::RecordPlacement(3)
        );
        assert_eq!(
            decide(&window_event(WindowChange::Close, 4), "i3pm:switch:"),
            Action::Forget(4)
        );
        assert_eq!(
            decide(&window_event(WindowChange::Title, 5), "i3pm:switch:"),
            Action::Ignore
        );
    }

    #[test]
    fn test_tick_events() {
        let tick = |payload: &str, first: bool| ManagerEvent::Tick {
            payload: payload.to_string(),
            first,
        };
        assert_eq!(
            decide(&tick("i3pm:switch:nixos", false), "i3pm:switch:"),
            Action::Switch("nixos".to_string())
        );
        assert_eq!(
            decide(&tick("i3pm:switch:", false), "i3pm:switch:"),
            Action::Switch(String::new())
        );
        assert_eq!(decide(&tick("other", false), "i3pm:switch:"), Action::Ignore);
        assert_eq!(decide(&tick("", true), "i3pm:switch:"), Action::Ignore);
    }

    #[test]
    fn test_lifecycle_events() {
        assert_eq!(
            decide(&ManagerEvent::Output { change: "unspecified".into() }, "p"),
            Action::OutputsChanged("unspecified".into())
        );
        assert_eq!(
            decide(&ManagerEvent::Shutdown { change: "exit".into() }, "p"),
            Action::Shutdown("exit".into())
        );
        assert_eq!(
            decide(&ManagerEvent::Workspace { change: "focus".into() }, "p"),
            Action::Ignore
        );
    }

    #[test]
    fn test_new_window_target() {
        let app = ApplicationDescriptor {
            name: "code".to_string(),
            scope: AppScope::Scoped,
            preferred_workspace: Some(2),
            expected_class: None,
        };
        assert_eq!(new_window_target(Some(&app), Some(5)), Some(2));
        assert_eq!(new_window_target(Some(&app), Some(2)), None);
        assert_eq!(new_window_target(Some(&app), None), Some(2));
        assert_eq!(new_window_target(None, Some(5)), None);

        let no_pref = ApplicationDescriptor {
            preferred_workspace: None,
            ..app.clone()
        };
        assert_eq!(new_window_target(Some(&no_pref), Some(5)), None);

        let bad_pref = ApplicationDescriptor {
            preferred_workspace: Some(99),
            ..app
        };
        assert_eq!(new_window_target(Some(&bad_pref), Some(5)), None);
    }

    #[test]
    fn test_placement_record() {
        let window = WindowSnapshot {
            id: 7,
            pid: Some(1),
            class: "firefox".to_string(),
            title: "Mozilla".to_string(),
            workspace_num: Some(4),
            workspace_name: Some("4:web".to_string()),
            floating: true,
            scratchpad: false,
            marks: Vec::new(),
        };
        let owner = WindowOwner {
            ownership: Ownership::Scoped("api".to_string()),
            app_name: Some("browser".to_string()),
        };

        let record = placement_record(&window, Some(&owner), 99).unwrap();
        assert_eq!(record.workspace_number, 4);
        assert!(record.floating);
        assert_eq!(record.project_name, "api");
        assert_eq!(record.app_name, "browser");
        assert_eq!(record.window_class, "firefox");
        assert_eq!(record.last_seen, 99);

        let scratch = WindowSnapshot {
            scratchpad: true,
            workspace_num: None,
            ..window.clone()
        };
        assert!(placement_record(&scratch, Some(&owner), 99).is_none());

        let named = WindowSnapshot {
            workspace_num: None,
            ..window
        };
        assert!(placement_record(&named, None, 99).is_none());
    }
}
