//! Scope frames
//!
//! A scope is a lexically nested configuration frame: the global scope at
//! the root, then (per directory tree) project, subproject, and rules
//! scopes. Child scopes inherit the build-directory setting, module lists,
//! and the pending recursion set; each scope owns its module bindings,
//! deferred functions, and (for rules scopes) the directory's persistent
//! cache.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use crate::api::DeferredFn;
use crate::cache::DirCache;
use crate::graph::TargetId;
use crate::module::ModuleBinding;
use crate::paths::PathContext;

/// Id for scopes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);

impl ScopeId {
    /// The global (root) scope.
    pub const ROOT: ScopeId = ScopeId(0);

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// The kind of a scope frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ScopeKind {
    /// The process-wide root scope.
    Global,
    /// A directory containing a project marker.
    Project,
    /// A directory containing a subproject marker.
    Subproject,
    /// A visited directory's rules frame.
    Rules,
}

impl ScopeKind {
    /// The lowercase name used in log and error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Project => "project",
            Self::Subproject => "subproj",
            Self::Rules => "rules",
        }
    }
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configuration frame.
pub struct ScopeData {
    /// This scope's id.
    pub id: ScopeId,
    /// The parent frame, absent only for the global scope.
    pub parent: Option<ScopeId>,
    /// What kind of frame this is.
    pub kind: ScopeKind,
    /// The scope's directory.
    pub dir: PathBuf,
    /// The owning project directory.
    pub proj_dir: PathBuf,
    /// The build-directory setting, resolved against `dir` when used.
    pub build_dir: String,
    /// Modules loaded if a visited directory has no rules description.
    pub default_modules: Vec<String>,
    /// Modules loaded before the rules description.
    pub pre_modules: Vec<String>,
    /// Directories this scope asked to recurse into.
    pub recurse_dirs: BTreeSet<PathBuf>,
    /// Strong module bindings, by name.
    pub modules: HashMap<String, ModuleBinding>,
    /// Weak module bindings: present, but `post_*` hooks do not fire.
    pub weak_modules: HashMap<String, ModuleBinding>,
    /// Targets declared in this scope, by their user-supplied path.
    pub local_targets: HashMap<String, TargetId>,
    /// The directory's persistent cache (rules scopes only).
    pub cache: Option<DirCache>,
    /// Deferred functions queued by `do_later`.
    pub do_later: Vec<DeferredFn>,
}

impl std::fmt::Debug for ScopeData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeData")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("dir", &self.dir)
            .field("proj_dir", &self.proj_dir)
            .field("build_dir", &self.build_dir)
            .finish_non_exhaustive()
    }
}

impl ScopeData {
    /// The path-resolution view of this scope.
    pub fn path_context(&self) -> PathContext {
        PathContext {
            dir: self.dir.clone(),
            proj_dir: self.proj_dir.clone(),
            build_dir: self.build_dir.clone(),
        }
    }
}

/// The scope arena.
#[derive(Debug)]
pub struct Scopes {
    arena: Vec<ScopeData>,
}

impl Scopes {
    /// Create the arena with its global root scope.
    pub fn new(root_dir: PathBuf, proj_dir: PathBuf) -> Self {
        let root = ScopeData {
            id: ScopeId::ROOT,
            parent: None,
            kind: ScopeKind::Global,
            dir: root_dir,
            proj_dir,
            build_dir: "__build__".to_string(),
            default_modules: Vec::new(),
            pre_modules: Vec::new(),
            recurse_dirs: BTreeSet::new(),
            modules: HashMap::new(),
            weak_modules: HashMap::new(),
            local_targets: HashMap::new(),
            cache: None,
            do_later: Vec::new(),
        };
        Self { arena: vec![root] }
    }

    /// Borrow a scope.
    pub fn get(&self, id: ScopeId) -> &ScopeData {
        &self.arena[id.index()]
    }

    /// Mutably borrow a scope.
    pub fn get_mut(&mut self, id: ScopeId) -> &mut ScopeData {
        &mut self.arena[id.index()]
    }

    /// All scope ids, in creation order.
    pub fn ids(&self) -> impl Iterator<Item = ScopeId> + use<> {
        (0..self.arena.len() as u32).map(ScopeId)
    }

    /// Create a child scope, inheriting the parent's settings.
    pub fn push_child(
        &mut self,
        parent: ScopeId,
        kind: ScopeKind,
        dir: &Path,
        proj_dir: &Path,
    ) -> ScopeId {
        let id = ScopeId(self.arena.len() as u32);
        let p = self.get(parent);
        let child = ScopeData {
            id,
            parent: Some(parent),
            kind,
            dir: dir.to_path_buf(),
            proj_dir: proj_dir.to_path_buf(),
            build_dir: p.build_dir.clone(),
            default_modules: p.default_modules.clone(),
            pre_modules: p.pre_modules.clone(),
            recurse_dirs: p.recurse_dirs.clone(),
            modules: HashMap::new(),
            weak_modules: HashMap::new(),
            local_targets: HashMap::new(),
            cache: None,
            do_later: Vec::new(),
        };
        self.arena.push(child);
        id
    }
}
