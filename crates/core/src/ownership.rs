//! Window ownership parsed from launch metadata.
//!
//! Applications launched through i3pm carry their project association in
//! their process environment. [`Ownership::from_environment`] is the only place
//! that inspects those strings; everything downstream matches on three cases.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Environment variable holding the scope (`scoped` or `global`).
pub const SCOPE_VAR: &str = "I3PM_SCOPE";

/// Environment variable holding the owning project name.
pub const PROJECT_VAR: &str = "I3PM_PROJECT_NAME";

/// Environment variable holding the registry application name.
pub const APP_NAME_VAR: &str = "I3PM_APP_NAME";

/// Who a window belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "project", rename_all = "snake_case")]
pub enum Ownership {
    /// Belongs to the named project.
    Scoped(String),
    /// Explicitly global.
    Global,
    /// No usable metadata, or the owning process is gone.
    Unknown,
}

impl Ownership {
    /// Parse ownership from a process environment.
    ///
    /// A `scoped` scope without a project name counts as global, since an
    /// empty project name means global everywhere else.
    pub fn from_environment(env: &HashMap<String, String>) -> Self {
        let scope = env.get(SCOPE_VAR).map(|s| s.trim().to_ascii_lowercase());
        match scope.as_deref() {
            Some("scoped") => {
                let project = env.get(PROJECT_VAR).map(|p| p.trim()).unwrap_or("");
                if project.is_empty() {
                    Ownership::Global
                } else {
                    Ownership::Scoped(project.to_string())
                }
            }
            Some("global") => Ownership::Global,
            _ => Ownership::Unknown,
        }
    }

    /// The owning project, if scoped.
    pub fn project(&self) -> Option<&str> {
        match self {
            Ownership::Scoped(project) => Some(project),
            Ownership::Global | Ownership::Unknown => None,
        }
    }

    /// Project name as stored in records (empty for global/unknown).
    pub fn record_project(&self) -> String {
        self.project().unwrap_or_default().to_string()
    }
}

/// Ownership plus the application identity recovered from the same read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowOwner {
    pub ownership: Ownership,
    pub app_name: Option<String>,
}

impl WindowOwner {
    /// Parse everything the daemon needs from one environment.
    pub fn from_environment(env: &HashMap<String, String>) -> Self {
        let app_name = env
            .get(APP_NAME_VAR)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Self {
            ownership: Ownership::from_environment(env),
            app_name,
        }
    }

    /// Owner used when the environment could not be read.
    pub fn unknown() -> Self {
        Self {
            ownership: Ownership::Unknown,
            app_name: None,
        }
    }
}

/// Classification verdict for a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Visible,
    Hidden,
}

/// Decide whether a window should be visible while `active_project` is active.
///
/// Only scoped windows of another project are hidden. Global and unknown
/// windows are always visible so orphaned windows never disappear.
pub fn classify(ownership: &Ownership, active_project: &str) -> Verdict {
    match ownership {
        Ownership::Scoped(project) if project == active_project => Verdict::Visible,
        Ownership::Scoped(_) => Verdict::Hidden,
        Ownership::Global | Ownership::Unknown => Verdict::Visible,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_scoped_with_project() {
        let e = env(&[(SCOPE_VAR, "scoped"), (PROJECT_VAR, "nixos")]);
        assert_eq!(Ownership::from_environment(&e), Ownership::Scoped("nixos".into()));
    }

    #[test]
    fn test_scope_is_case_insensitive_and_trimmed() {
        let e = env(&[(SCOPE_VAR, " Scoped\n"), (PROJECT_VAR, " api ")]);
        assert_eq!(Ownership::from_environment(&e), Ownership::Scoped("api".into()));
    }

    #[test]
    fn test_scoped_without_project_is_global() {
        let e = env(&[(SCOPE_VAR, "scoped"), (PROJECT_VAR, "")]);
        assert_eq!(Ownership::from_environment(&e), Ownership::Global);

        let e = env(&[(SCOPE_VAR, "scoped")]);
        assert_eq!(Ownership::from_environment(&e), Ownership::Global);
    }

    #[test]
    fn test_global_and_unknown() {
        let e = env(&[(SCOPE_VAR, "global"), (PROJECT_VAR, "ignored")]);
        assert_eq!(Ownership::from_environment(&e), Ownership::Global);

        let e = env(&[(SCOPE_VAR, "sometimes")]);
        assert_eq!(Ownership::from_environment(&e), Ownership::Unknown);

        let e = env(&[("PATH", "/usr/bin")]);
        assert_eq!(Ownership::from_environment(&e), Ownership::Unknown);
    }

    #[test]
    fn test_owner_app_name() {
        let e = env(&[(SCOPE_VAR, "global"), (APP_NAME_VAR, "firefox")]);
        let owner = WindowOwner::from_environment(&e);
        assert_eq!(owner.app_name.as_deref(), Some("firefox"));

        let e = env(&[(APP_NAME_VAR, "  ")]);
        assert!(WindowOwner::from_environment(&e).app_name.is_none());
    }

    #[test]
    fn test_classify_scoped() {
        let owned = Ownership::Scoped("a".into());
        assert_eq!(classify(&owned, "a"), Verdict::Visible);
        assert_eq!(classify(&owned, "b"), Verdict::Hidden);
        assert_eq!(classify(&owned, ""), Verdict::Hidden);
    }

    #[test]
    fn test_classify_global_and_unknown_always_visible() {
        for active in ["", "a", "b"] {
            assert_eq!(classify(&Ownership::Global, active), Verdict::Visible);
            assert_eq!(classify(&Ownership::Unknown, active), Verdict::Visible);
        }
    }

    #[test]
    fn test_ownership_serialization() {
        let json = serde_json::to_string(&Ownership::Scoped("a".into())).unwrap();
        assert_eq!(json, r#"{"kind":"scoped","project":"a"}"#);
        let json = serde_json::to_string(&Ownership::Unknown).unwrap();
        assert_eq!(json, r#"{"kind":"unknown"}"#);
    }
}
