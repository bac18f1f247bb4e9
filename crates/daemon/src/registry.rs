//! Application registry and project catalog.
//!
//! Both are authored outside the daemon and loaded once at startup.
//!
//! # Example registry
//!
//! ```json
//! [
//!   { "name": "terminal", "scope": "scoped", "preferred_workspace": 1, "expected_class": "^Alacritty$" },
//!   { "name": "firefox", "scope": "global", "preferred_workspace": 3, "expected_class": "(?i)firefox" }
//! ]
//! ```

use i3pm_core::{ApplicationDescriptor, ProjectContext};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// An application with its class pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledApp {
    pub descriptor: ApplicationDescriptor,
    class_pattern: Option<Regex>,
}

impl CompiledApp {
    fn compile(descriptor: ApplicationDescriptor) -> Self {
        let class_pattern = descriptor.expected_class.as_deref().and_then(|pattern| {
            match Regex::new(pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(
                        "Invalid expected_class regex for application '{}': {}",
                        descriptor.name, e
                    );
                    None
                }
            }
        });
        Self {
            descriptor,
            class_pattern,
        }
    }

    /// Whether the window class matches this application's pattern.
    pub fn matches_class(&self, class: &str) -> bool {
        self.class_pattern
            .as_ref()
            .is_some_and(|re| re.is_match(class))
    }
}

/// The application registry.
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    apps: Vec<CompiledApp>,
}

impl AppRegistry {
    /// Build a registry, compiling every class pattern.
    pub fn from_descriptors(descriptors: Vec<ApplicationDescriptor>) -> Self {
        Self {
            apps: descriptors.into_iter().map(CompiledApp::compile).collect(),
        }
    }

    /// Load a JSON array of application descriptors.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let descriptors: Vec<ApplicationDescriptor> =
            serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Loaded {} applications from {}", descriptors.len(), path.display());
        Ok(Self::from_descriptors(descriptors))
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Look up an application by its registry name.
    pub fn by_name(&self, name: &str) -> Option<&ApplicationDescriptor> {
        self.apps
            .iter()
            .find(|app| app.descriptor.name == name)
            .map(|app| &app.descriptor)
    }

    /// First application whose class pattern matches.
    pub fn match_class(&self, class: &str) -> Option<&ApplicationDescriptor> {
        self.apps
            .iter()
            .find(|app| app.matches_class(class))
            .map(|app| &app.descriptor)
    }

    /// Resolve a window's application: launch metadata first, then class.
    pub fn resolve(&self, app_name: Option<&str>, class: &str) -> Option<&ApplicationDescriptor> {
        app_name
            .and_then(|name| self.by_name(name))
            .or_else(|| self.match_class(class))
    }
}

/// Known projects, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ProjectCatalog {
    projects: BTreeMap<String, ProjectContext>,
}

impl ProjectCatalog {
    pub fn from_projects(projects: impl IntoIterator<Item = ProjectContext>) -> Self {
        Self {
            projects: projects.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    /// Load every `*.json` project definition in `dir`.
    ///
    /// Files that fail to parse are skipped with a warning. A definition
    /// without a name takes the file stem.
    pub fn load_dir(dir: &Path) -> Result<Self, RegistryError> {
        let entries = std::fs::read_dir(dir).map_err(|source| RegistryError::Read {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut projects = BTreeMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match load_project(&path) {
                Ok(project) => {
                    projects.insert(project.name.clone(), project);
                }
                Err(e) => warn!("Skipping project definition: {}", e),
            }
        }
        debug!("Loaded {} projects from {}", projects.len(), dir.display());
        Ok(Self { projects })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.projects.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ProjectContext> {
        self.projects.get(name)
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}

fn load_project(path: &Path) -> Result<ProjectContext, RegistryError> {
    let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut project: ProjectContext =
        serde_json::from_str(&content).map_err(|source| RegistryError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    if project.name.is_empty() {
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            project.name = stem.to_string();
        }
    }
    Ok(project)
}

#[cfg(test)]
mod tests {
    use super::*;
    use i3pm_core::AppScope;
    use std::sync::atomic::{AtomicU32, Ordering};

    static TEST_ID: AtomicU32 = AtomicU32::new(0);

    fn unique_temp_dir(label: &str) -> PathBuf {
        let id = TEST_ID.fetch_add(1, Ordering::SeqCst);
        let dir = std::env::temp_dir().join(format!(
            "i3pm-registry-{}-{}-{}",
            label,
            std::process::id(),
            id
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn app(name: &str, class: Option<&str>, ws: Option<i32>) -> ApplicationDescriptor {
        ApplicationDescriptor {
            name: name.to_string(),
            scope: AppScope::Scoped,
            preferred_workspace: ws,
            expected_class: class.map(str::to_string),
        }
    }

    #[test]
    fn test_resolve_prefers_launch_metadata() {
        let registry = AppRegistry::from_descriptors(vec![
            app("terminal", Some("^Alacritty$"), Some(1)),
            app("scratch-term", Some("Alacritty"), Some(9)),
        ]);

        let by_name = registry.resolve(Some("scratch-term"), "Alacritty").unwrap();
        assert_eq!(by_name.preferred_workspace, Some(9));

        let by_class = registry.resolve(None, "Alacritty").unwrap();
        assert_eq!(by_class.name, "terminal");

        let unknown_name = registry.resolve(Some("missing"), "Alacritty").unwrap();
        assert_eq!(unknown_name.name, "terminal");

        assert!(registry.resolve(None, "firefox").is_none());
    }

    #[test]
    fn test_invalid_pattern_never_matches() {
        let registry = AppRegistry::from_descriptors(vec![app("broken", Some("(unclosed"), None)]);
        assert_eq!(registry.len(), 1);
        assert!(registry.match_class("(unclosed").is_none());
        assert!(registry.by_name("broken").is_some());
    }

    #[test]
    fn test_load_registry_file() {
        let dir = unique_temp_dir("apps");
        let path = dir.join("apps.json");
        std::fs::write(
            &path,
            r#"[{"name":"code","scope":"scoped","preferred_workspace":2,"expected_class":"(?i)^code$"},
                {"name":"firefox"}]"#,
        )
        .unwrap();

        let registry = AppRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 2);
        let code = registry.match_class("Code").unwrap();
        assert_eq!(code.scope, AppScope::Scoped);
        assert_eq!(registry.by_name("firefox").unwrap().scope, AppScope::Global);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_registry_errors() {
        let dir = unique_temp_dir("apps-bad");
        assert!(matches!(
            AppRegistry::load(&dir.join("missing.json")),
            Err(RegistryError::Read { .. })
        ));

        let path = dir.join("apps.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(AppRegistry::load(&path), Err(RegistryError::Parse { .. })));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_project_catalog_dir() {
        let dir = unique_temp_dir("projects");
        std::fs::write(
            dir.join("nixos.json"),
            r#"{"name":"nixos","directory":"/etc/nixos","display_name":"NixOS","icon":"❄"}"#,
        )
        .unwrap();
        std::fs::write(dir.join("api.json"), r#"{"name":"","directory":"/src/api"}"#).unwrap();
        std::fs::write(dir.join("broken.json"), "nope").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let catalog = ProjectCatalog::load_dir(&dir).unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.contains("nixos"));
        assert!(catalog.contains("api"));
        assert!(!catalog.contains("broken"));
        assert_eq!(catalog.get("nixos").unwrap().display_name, "NixOS");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
