//! The built-in clean module
//!
//! Inserted at the root scope and prepended to the pre-module list, so
//! every rules scope gets a virtual `clean` target whose rule removes the
//! scope's build directory (when it lives inside the scope directory).
//! `subdir()` attaches child `clean` targets, so cleaning cascades down a
//! project tree.

use crate::api::{Emk, RuleContext, RuleOpts};
use crate::module::{Module, NewScope};
use crate::paths::ALWAYS_BUILD;
use crate::scope::ScopeKind;

/// The clean module. `remove_build_dir` may be disabled per scope from a
/// build description.
#[derive(Debug, Clone)]
pub struct CleanModule {
    /// Whether `clean` removes the scope's build directory.
    pub remove_build_dir: bool,
}

impl Default for CleanModule {
    fn default() -> Self {
        Self {
            remove_build_dir: true,
        }
    }
}

fn clean_func(ctx: &mut RuleContext<'_>, remove_build_dir: bool) -> anyhow::Result<()> {
    let build_dir = ctx.build_dir();
    if remove_build_dir && build_dir.starts_with(ctx.scope_dir()) {
        tracing::info!("Removing directory {}", build_dir.display());
        // Removal failures are tolerated; a half-removed build dir is
        // rebuilt from scratch anyway.
        let _ = std::fs::remove_dir_all(&build_dir);
    } else {
        tracing::info!("Not removing directory {}", build_dir.display());
    }
    ctx.mark_virtual(&["clean"]);
    Ok(())
}

impl Module for CleanModule {
    fn post(&mut self, emk: &Emk<'_>, kind: ScopeKind) -> anyhow::Result<()> {
        if kind == ScopeKind::Rules {
            let remove_build_dir = self.remove_build_dir;
            emk.rule(
                &["clean"],
                &[ALWAYS_BUILD],
                move |ctx| clean_func(ctx, remove_build_dir),
                RuleOpts {
                    cwd_safe: true,
                    ex_safe: true,
                    ..RuleOpts::default()
                },
            )?;
        }
        Ok(())
    }

    fn new_scope(&mut self, _kind: ScopeKind) -> NewScope {
        NewScope::Instance(Box::new(self.clone()))
    }
}
