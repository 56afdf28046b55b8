//! The build graph: targets, rules, aliases, and pending dependency tables
//!
//! Targets and rules live in arenas and are referenced by dense ids.
//! Dependencies declared before their producing rule exists (secondary,
//! weak, attached) accumulate in pending tables keyed by target path and
//! are reconciled between build phases, once aliases have reached a fixed
//! point and deferred build-directory placeholders can be resolved.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use crate::api::{Args, RuleFn};
use crate::cache::ChangeFn;
use crate::error::{BuildError, ErrorKind, Origin, Result};
use crate::paths::DepPath;
use crate::scope::ScopeId;

/// Id for target nodes in the graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TargetId(u32);

impl TargetId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Id for rules in the graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct RuleId(u32);

impl RuleId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A named buildable node, identified by canonical path.
#[derive(Debug)]
pub struct Target {
    /// The user-supplied form of the path.
    pub orig_path: String,
    /// The canonical path (or the always-build sentinel).
    pub path: DepPath,
    /// The producing rule, if any; otherwise this is an external file or an
    /// alias placeholder.
    pub rule: Option<RuleId>,
    /// Paths that must also be built whenever this target is built.
    pub attached: BTreeSet<DepPath>,
    /// Rules that require this target.
    pub required_by: BTreeSet<RuleId>,
    /// Opt-in product-mutation detection.
    pub rebuild_if_changed: bool,
    /// Whether this target has been examined in the current phase.
    pub visited: bool,
    /// Whether this target has been built (or found to exist).
    pub built: bool,
    /// Logical modification time for virtual products.
    pub virtual_mtime: Option<crate::cache::FileStamp>,
}

impl Target {
    fn new(orig_path: String, path: DepPath, rule: Option<RuleId>) -> Self {
        Self {
            orig_path,
            path,
            rule,
            attached: BTreeSet::new(),
            required_by: BTreeSet::new(),
            rebuild_if_changed: false,
            visited: false,
            built: false,
            virtual_mtime: None,
        }
    }
}

/// The immutable core of a rule, shared with the executor while the rule's
/// body runs.
pub struct RuleSpec {
    /// This rule's id.
    pub id: RuleId,
    /// The build function.
    pub func: RuleFn,
    /// Opaque arguments forwarded to the build function.
    pub args: Option<Args>,
    /// Whether the rule may run without holding the process working dir.
    pub cwd_safe: bool,
    /// Whether the rule tolerates partial execution under interruption.
    pub ex_safe: bool,
    /// The change detector used for this rule's paths.
    pub has_changed: ChangeFn,
    /// The scope the rule was declared in.
    pub scope: ScopeId,
    /// Declaration site, for error reporting.
    pub origin: Origin,
    /// Hard requirements not yet built; the rule becomes ready at zero.
    pub remaining_unbuilt: AtomicUsize,
}

impl std::fmt::Debug for RuleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleSpec")
            .field("id", &self.id)
            .field("cwd_safe", &self.cwd_safe)
            .field("ex_safe", &self.ex_safe)
            .field("scope", &self.scope)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// A producer: build function, products, and dependencies.
#[derive(Debug)]
pub struct Rule {
    /// The shared immutable core.
    pub spec: Arc<RuleSpec>,
    /// Produced targets, in declaration order.
    pub produces: Vec<TargetId>,
    /// Primary dependency paths.
    pub requires: Vec<DepPath>,
    /// Secondary dependencies added via `depend`.
    pub secondary: BTreeSet<DepPath>,
    /// Weak dependencies added via `weak_depend`.
    pub weak: BTreeSet<DepPath>,
    /// Reconciled requirements: `(target, weak?)`.
    pub required: Vec<(TargetId, bool)>,
    /// Whether the current phase wants this rule built.
    pub want_build: bool,
    /// Whether the rule has been examined-and-completed this run.
    pub built: bool,
    /// Whether the rule's body actually executed this run.
    pub executed: bool,
    /// The rule's cache identity key, derived from its product paths.
    pub key: Option<String>,
}

/// The engine's target/rule/alias bookkeeping.
#[derive(Debug, Default)]
pub struct Graph {
    targets: Vec<Target>,
    by_path: HashMap<DepPath, TargetId>,
    rules: Vec<Rule>,

    /// Pending aliases: alias path → target path.
    pub aliases: HashMap<PathBuf, PathBuf>,
    /// Aliases resolved to targets at the last reconciliation.
    pub fixed_aliases: HashMap<PathBuf, TargetId>,

    /// Pending secondary dependencies: target path → dep paths.
    pub secondary_pending: HashMap<PathBuf, Vec<DepPath>>,
    /// Pending weak dependencies: target path → dep paths.
    pub weak_pending: HashMap<PathBuf, Vec<DepPath>>,
    /// Pending attachments: anchor path → attached paths.
    pub attached_pending: HashMap<PathBuf, Vec<DepPath>>,

    /// Paths that must be produced by some rule.
    pub requires_rule: HashSet<DepPath>,
    /// Paths with opt-in product-mutation detection.
    pub rebuild_if_changed: HashSet<PathBuf>,

    /// Paths to build when no explicit targets apply.
    pub auto_targets: HashSet<PathBuf>,
    /// Auto targets resolved at the last reconciliation.
    pub fixed_auto_targets: Vec<TargetId>,
    /// Attachments discovered after their anchor was already built.
    pub must_build: Vec<TargetId>,
}

impl Graph {
    /// Borrow a target.
    pub fn target(&self, id: TargetId) -> &Target {
        &self.targets[id.index()]
    }

    /// Mutably borrow a target.
    pub fn target_mut(&mut self, id: TargetId) -> &mut Target {
        &mut self.targets[id.index()]
    }

    /// Borrow a rule.
    pub fn rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.index()]
    }

    /// Mutably borrow a rule.
    pub fn rule_mut(&mut self, id: RuleId) -> &mut Rule {
        &mut self.rules[id.index()]
    }

    /// All rule ids, in declaration order.
    pub fn rule_ids(&self) -> impl Iterator<Item = RuleId> + use<> {
        (0..self.rules.len() as u32).map(RuleId)
    }

    /// The live targets (reachable by path lookup).
    pub fn live_targets(&self) -> impl Iterator<Item = TargetId> + '_ {
        self.by_path.values().copied()
    }

    /// Look up a target by path, following fixed aliases.
    pub fn lookup(&self, path: &DepPath) -> Option<TargetId> {
        if let Some(id) = self.by_path.get(path) {
            return Some(*id);
        }
        if let DepPath::Path(p) = path {
            return self.fixed_aliases.get(p).copied();
        }
        None
    }

    /// Look up a target, creating an external (rule-less) one if absent.
    pub fn get_or_create(&mut self, path: DepPath) -> TargetId {
        if let Some(id) = self.lookup(&path) {
            return id;
        }
        tracing::debug!("Creating artificial target for {}", path.display_string());
        let orig = path.display_string();
        self.insert_target(Target::new(orig, path, None))
    }

    fn insert_target(&mut self, target: Target) -> TargetId {
        let id = TargetId(self.targets.len() as u32);
        self.by_path.insert(target.path.clone(), id);
        self.targets.push(target);
        id
    }

    /// Register a new rule (with no products yet) and return its id.
    pub fn push_rule(
        &mut self,
        func: RuleFn,
        args: Option<Args>,
        cwd_safe: bool,
        ex_safe: bool,
        has_changed: ChangeFn,
        scope: ScopeId,
        origin: Origin,
        requires: Vec<DepPath>,
    ) -> RuleId {
        let id = RuleId(self.rules.len() as u32);
        let spec = Arc::new(RuleSpec {
            id,
            func,
            args,
            cwd_safe,
            ex_safe,
            has_changed,
            scope,
            origin,
            remaining_unbuilt: AtomicUsize::new(0),
        });
        self.rules.push(Rule {
            spec,
            produces: Vec::new(),
            requires,
            secondary: BTreeSet::new(),
            weak: BTreeSet::new(),
            required: Vec::new(),
            want_build: false,
            built: false,
            executed: false,
            key: None,
        });
        id
    }

    /// Register one product of a rule.
    ///
    /// Fails if another rule already produces the path, or if the path was
    /// declared as an alias. An existing external target is adopted in
    /// place, keeping its back-edges.
    pub fn add_product(&mut self, rule: RuleId, orig: String, abs: PathBuf) -> Result<TargetId> {
        if self.aliases.contains_key(&abs) {
            return Err(BuildError::new(
                ErrorKind::DuplicateAlias,
                format!("Alias {} is produced by a rule", abs.display()),
            ));
        }
        let path = DepPath::Path(abs);
        let id = match self.by_path.get(&path) {
            Some(&existing) => {
                let target = &mut self.targets[existing.index()];
                if target.rule.is_some() {
                    return Err(BuildError::new(
                        ErrorKind::DuplicateRule,
                        format!("Duplicate rule producing {}", path.display_string()),
                    ));
                }
                target.rule = Some(rule);
                target.orig_path = orig;
                existing
            }
            None => self.insert_target(Target::new(orig, path, Some(rule))),
        };
        self.rules[rule.index()].produces.push(id);
        Ok(id)
    }

    /// Record a pending alias.
    pub fn add_alias(&mut self, alias: PathBuf, target: PathBuf) -> Result<()> {
        if self.aliases.contains_key(&alias) {
            return Err(BuildError::new(
                ErrorKind::DuplicateAlias,
                format!("Duplicate alias {}", alias.display()),
            ));
        }
        if self
            .lookup(&DepPath::Path(alias.clone()))
            .is_some_and(|id| self.target(id).rule.is_some())
        {
            return Err(BuildError::new(
                ErrorKind::DuplicateAlias,
                format!("Alias {} is produced by a rule", alias.display()),
            ));
        }
        tracing::debug!("Adding alias {} for {}", alias.display(), target.display());
        self.aliases.insert(alias, target);
        Ok(())
    }

    /// Drop rule-less targets from path lookup so the next phase re-creates
    /// them fresh (external files are re-examined each phase).
    pub fn remove_artificial_targets(&mut self) {
        let targets = &self.targets;
        self.by_path
            .retain(|_, id| targets[id.index()].rule.is_some());
    }

    /// Resolve aliases to targets by fixed-point iteration. Aliases that
    /// remain unresolved are treated as references to external files.
    pub fn fix_aliases(&mut self) {
        let mut unfixed: Vec<(PathBuf, PathBuf)> = self
            .aliases
            .iter()
            .map(|(a, t)| (a.clone(), t.clone()))
            .collect();
        let mut fixed: HashMap<PathBuf, TargetId> = HashMap::new();

        let mut made_progress = true;
        while made_progress && !unfixed.is_empty() {
            made_progress = false;
            let mut still_unfixed = Vec::new();
            for (alias, target) in unfixed {
                if let Some(&id) = self.by_path.get(&DepPath::Path(target.clone())) {
                    tracing::debug!("Fixed alias {} => {}", alias.display(), target.display());
                    fixed.insert(alias, id);
                    made_progress = true;
                } else if let Some(&id) = fixed.get(&target) {
                    fixed.insert(alias, id);
                    made_progress = true;
                } else {
                    still_unfixed.push((alias, target));
                }
            }
            unfixed = still_unfixed;
        }

        for (alias, target) in unfixed {
            tracing::debug!(
                "Could not fix alias {} => {}; assuming an external file",
                alias.display(),
                target.display()
            );
            let id = self.get_or_create(DepPath::Path(target));
            fixed.insert(alias, id);
        }

        self.fixed_aliases = fixed;
    }

    /// Whether any examined-this-run target in `set` remains unbuilt.
    pub fn have_unbuilt(&self, set: &BTreeSet<TargetId>) -> bool {
        set.iter().any(|id| !self.target(*id).built)
    }
}
