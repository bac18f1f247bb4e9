//! Partitioning a tree snapshot into the four filtering sets.
//!
//! Every window in the snapshot lands in exactly one of keep-visible, hide,
//! restore or keep-hidden. Only scratchpad windows that carry the daemon's
//! hidden mark are candidates for restoring; other scratchpad windows belong
//! to the user and are left alone.

use crate::ownership::{classify, Ownership, Verdict, WindowOwner};
use crate::{FilterMode, WindowId, WindowSnapshot};
use std::collections::HashMap;

/// Where a window ends up after planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    KeepVisible,
    Hide,
    Restore,
    KeepHidden,
}

/// The partition of one snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchPlan {
    pub keep_visible: Vec<WindowId>,
    pub to_hide: Vec<WindowId>,
    pub to_restore: Vec<WindowId>,
    pub keep_hidden: Vec<WindowId>,
}

impl SwitchPlan {
    /// Total number of windows covered by the plan.
    pub fn len(&self) -> usize {
        self.keep_visible.len() + self.to_hide.len() + self.to_restore.len() + self.keep_hidden.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Where a window was placed, if it was part of the snapshot.
    pub fn placement_of(&self, id: WindowId) -> Option<Placement> {
        if self.keep_visible.contains(&id) {
            Some(Placement::KeepVisible)
        } else if self.to_hide.contains(&id) {
            Some(Placement::Hide)
        } else if self.to_restore.contains(&id) {
            Some(Placement::Restore)
        } else if self.keep_hidden.contains(&id) {
            Some(Placement::KeepHidden)
        } else {
            None
        }
    }

    fn push(&mut self, id: WindowId, placement: Placement) {
        match placement {
            Placement::KeepVisible => self.keep_visible.push(id),
            Placement::Hide => self.to_hide.push(id),
            Placement::Restore => self.to_restore.push(id),
            Placement::KeepHidden => self.keep_hidden.push(id),
        }
    }
}

/// Decide the placement of a single window.
pub fn placement_for(
    window: &WindowSnapshot,
    ownership: &Ownership,
    mode: FilterMode,
    target: &str,
    hidden_mark: &str,
) -> Placement {
    if window.scratchpad {
        if !window.is_hidden_by(hidden_mark) {
            return Placement::KeepHidden;
        }
        let restore = match mode {
            FilterMode::Switch => classify(ownership, target) == Verdict::Visible,
            FilterMode::Restore => ownership.project() == Some(target),
            FilterMode::Hide => false,
        };
        return if restore {
            Placement::Restore
        } else {
            Placement::KeepHidden
        };
    }

    let hide = match mode {
        FilterMode::Switch => classify(ownership, target) == Verdict::Hidden,
        FilterMode::Hide => ownership.project() == Some(target),
        FilterMode::Restore => false,
    };
    if hide {
        Placement::Hide
    } else {
        Placement::KeepVisible
    }
}

/// Partition `windows` for `mode` against `target`.
///
/// Windows without an entry in `owners` are treated as unknown ownership.
pub fn plan_switch(
    windows: &[WindowSnapshot],
    owners: &HashMap<WindowId, WindowOwner>,
    mode: FilterMode,
    target: &str,
    hidden_mark: &str,
) -> SwitchPlan {
    let unknown = Ownership::Unknown;
    let mut plan = SwitchPlan::default();
    for window in windows {
        let ownership = owners
            .get(&window.id)
            .map(|o| &o.ownership)
            .unwrap_or(&unknown);
        plan.push(
            window.id,
            placement_for(window, ownership, mode, target, hidden_mark),
        );
    }
    plan
}
