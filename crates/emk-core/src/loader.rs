//! Build-description discovery
//!
//! The engine is parameterized over a [`ConfigSource`]: the thing that
//! knows whether a directory carries a project marker, a subproject marker,
//! or a rules description, and how to run that description against the
//! engine API. The production implementation is [`ScriptRegistry`], which
//! holds statically linked Rust closures keyed by canonical directory; it
//! also honors on-disk marker files so a directory tree shapes the scope
//! hierarchy even where no closure is registered.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::api::Emk;
use crate::paths::canonical_path;
use crate::scope::ScopeKind;

/// Marker file naming a project root.
pub const PROJECT_FILE: &str = "emk_project.py";

/// Marker file naming a subproject directory.
pub const SUBPROJ_FILE: &str = "emk_subproj.py";

/// The per-directory rules description.
pub const RULES_FILE: &str = "emk_rules.py";

/// The optional global configuration, searched for in the config dirs.
pub const GLOBAL_FILE: &str = "emk_global.py";

/// The marker file name for a scope kind.
pub fn marker_name(kind: ScopeKind) -> &'static str {
    match kind {
        ScopeKind::Global => GLOBAL_FILE,
        ScopeKind::Project => PROJECT_FILE,
        ScopeKind::Subproject => SUBPROJ_FILE,
        ScopeKind::Rules => RULES_FILE,
    }
}

/// Supplies build descriptions to the engine.
pub trait ConfigSource: Send + Sync {
    /// Whether `dir` carries a description (or marker) for scopes of `kind`.
    fn probe(&self, dir: &Path, kind: ScopeKind) -> bool;

    /// Run the description for `dir`/`kind` against the engine API.
    fn load(&self, emk: &Emk<'_>, dir: &Path, kind: ScopeKind) -> anyhow::Result<()>;
}

/// A build-description closure.
pub type ScriptFn = Arc<dyn Fn(&Emk<'_>) -> anyhow::Result<()> + Send + Sync>;

/// The statically linked description registry.
#[derive(Default, Clone)]
pub struct ScriptRegistry {
    scripts: HashMap<(PathBuf, &'static str), ScriptFn>,
}

impl std::fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRegistry")
            .field("dirs", &self.scripts.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ScriptRegistry {
    fn insert<F>(&mut self, dir: &Path, kind: ScopeKind, script: F)
    where
        F: Fn(&Emk<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let key = (canonical_path(dir), marker_name(kind));
        self.scripts.insert(key, Arc::new(script));
    }

    /// Register a project description for `dir` (also marks it a project).
    pub fn project_at<F>(&mut self, dir: &Path, script: F)
    where
        F: Fn(&Emk<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(dir, ScopeKind::Project, script);
    }

    /// Register a subproject description for `dir`.
    pub fn subproj_at<F>(&mut self, dir: &Path, script: F)
    where
        F: Fn(&Emk<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(dir, ScopeKind::Subproject, script);
    }

    /// Register a rules description for `dir`.
    pub fn rules_at<F>(&mut self, dir: &Path, script: F)
    where
        F: Fn(&Emk<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(dir, ScopeKind::Rules, script);
    }

    /// Register the global configuration for a config dir.
    pub fn global_at<F>(&mut self, dir: &Path, script: F)
    where
        F: Fn(&Emk<'_>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(dir, ScopeKind::Global, script);
    }
}

impl ConfigSource for ScriptRegistry {
    fn probe(&self, dir: &Path, kind: ScopeKind) -> bool {
        let key = (canonical_path(dir), marker_name(kind));
        self.scripts.contains_key(&key) || dir.join(marker_name(kind)).is_file()
    }

    fn load(&self, emk: &Emk<'_>, dir: &Path, kind: ScopeKind) -> anyhow::Result<()> {
        let key = (canonical_path(dir), marker_name(kind));
        match self.scripts.get(&key) {
            Some(script) => script(emk),
            None => {
                // Marker file with no linked description: the directory still
                // shapes the scope tree, it just contributes nothing itself.
                tracing::debug!(
                    "No build description registered for {} ({kind})",
                    dir.display()
                );
                Ok(())
            }
        }
    }
}

/// Find the project directory for `start`: the nearest ancestor (including
/// `start` itself) with a project description. Falls back to `start` when
/// there is none.
pub fn find_project_dir(start: &Path, source: &dyn ConfigSource) -> PathBuf {
    let mut dir = start;
    loop {
        if source.probe(dir, ScopeKind::Project) {
            return dir.to_path_buf();
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return start.to_path_buf(),
        }
    }
}

/// The global-config search path: `EMK_CONFIG_DIRS` (colon-separated) if
/// set, otherwise `config/` next to the running binary.
pub fn default_config_dirs() -> Vec<PathBuf> {
    if let Ok(val) = std::env::var("EMK_CONFIG_DIRS") {
        return val
            .split(':')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
    }
    match std::env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|d| vec![d.join("config")])
            .unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_probe_by_closure_and_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        std::fs::write(b.join(RULES_FILE), b"").unwrap();

        let mut registry = ScriptRegistry::default();
        registry.rules_at(&a, |_emk| Ok(()));

        assert!(registry.probe(&a, ScopeKind::Rules));
        assert!(registry.probe(&b, ScopeKind::Rules));
        assert!(!registry.probe(&a, ScopeKind::Project));
        assert!(!registry.probe(tmp.path(), ScopeKind::Rules));
    }

    #[test]
    fn test_find_project_dir_walks_up() {
        let tmp = tempfile::tempdir().unwrap();
        let root = canonical_path(tmp.path());
        let nested = root.join("x/y");
        std::fs::create_dir_all(&nested).unwrap();

        let mut registry = ScriptRegistry::default();
        registry.project_at(&root, |_emk| Ok(()));
        assert_eq!(find_project_dir(&nested, &registry), root);

        let empty = ScriptRegistry::default();
        assert_eq!(find_project_dir(&nested, &empty), nested);
    }
}
