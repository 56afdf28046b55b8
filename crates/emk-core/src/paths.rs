//! Path resolution and placeholder expansion
//!
//! User-supplied paths may begin with `$:proj:$` (the requesting scope's
//! project directory) or `$:build:$` (the scope's build directory). Product
//! paths expand both placeholders at declaration time. Requirement paths keep
//! `$:build:$` literal, because the build directory of the directory that
//! will produce the requirement may not be known yet; those are resolved
//! later against the table of build dirs recorded for every visited
//! directory.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::error::{BuildError, ErrorKind, Result};

/// Placeholder for the requesting scope's project directory.
pub const PROJ_PLACEHOLDER: &str = "$:proj:$";

/// Placeholder for the requesting scope's build directory.
pub const BUILD_PLACEHOLDER: &str = "$:build:$";

/// Sentinel requirement that is always considered changed, forcing its
/// dependent rule to execute every build phase.
pub const ALWAYS_BUILD: &str = "$:always:$";

/// A resolved dependency or target path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DepPath {
    /// The always-build sentinel.
    Always,
    /// A canonical absolute path (which may still contain a literal
    /// `$:build:$` component awaiting late resolution).
    Path(PathBuf),
}

impl DepPath {
    /// The filesystem path, if this is not the always-build sentinel.
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Always => None,
            Self::Path(p) => Some(p),
        }
    }

    /// Display form: the path, or the sentinel token.
    pub fn display_string(&self) -> String {
        match self {
            Self::Always => ALWAYS_BUILD.to_string(),
            Self::Path(p) => p.to_string_lossy().into_owned(),
        }
    }
}

/// The path-affecting settings of a scope, passed explicitly so that path
/// resolution has no view of scope internals.
#[derive(Debug, Clone)]
pub struct PathContext {
    /// The scope's own directory; relative paths are joined against it.
    pub dir: PathBuf,
    /// The scope's project directory (`$:proj:$`).
    pub proj_dir: PathBuf,
    /// The scope's build-directory setting (`$:build:$`), itself possibly
    /// relative to the scope directory.
    pub build_dir: String,
}

impl PathContext {
    /// The scope's build directory as an absolute path.
    pub fn abs_build_dir(&self) -> PathBuf {
        let bd = Path::new(&self.build_dir);
        if bd.is_absolute() {
            canonical_path(bd)
        } else {
            canonical_path(&self.dir.join(bd))
        }
    }
}

/// Lexically normalize a path: resolve `.` and `..` components without
/// touching the filesystem.
pub fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping past the root is a no-op; a relative path keeps
                // leading `..` components.
                match out.components().next_back() {
                    Some(Component::Normal(_)) => {
                        out.pop();
                    }
                    Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                    _ => out.push(".."),
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Canonicalize a path that may not (fully) exist: the deepest existing
/// ancestor is resolved through the filesystem (following symlinks), and the
/// nonexistent tail is appended after lexical normalization.
pub fn canonical_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        normalize_lexical(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        normalize_lexical(&cwd.join(path))
    };

    let mut existing = absolute.as_path();
    let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
    loop {
        if let Ok(resolved) = std::fs::canonicalize(existing) {
            let mut out = resolved;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name);
                existing = parent;
            }
            _ => return absolute,
        }
    }
}

/// Join `path` against the scope directory if relative.
fn scope_abspath(path: &str, ctx: &PathContext) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        ctx.dir.join(p)
    }
}

/// Compute a target abspath: expand a leading `$:proj:$`, expand every
/// `$:build:$`, join against the scope dir, and canonicalize.
pub fn target_abspath(path: &str, ctx: &PathContext) -> PathBuf {
    let mut s = path.to_string();
    if let Some(rest) = s.strip_prefix(PROJ_PLACEHOLDER) {
        s = format!("{}{}", ctx.proj_dir.to_string_lossy(), rest);
    }
    s = s.replace(BUILD_PLACEHOLDER, &ctx.build_dir);
    canonical_path(&scope_abspath(&s, ctx))
}

/// Compute a require abspath: expand a leading `$:proj:$` but keep
/// `$:build:$` literal for late resolution; join and canonicalize.
pub fn require_abspath(path: &str, ctx: &PathContext) -> DepPath {
    if path == ALWAYS_BUILD {
        return DepPath::Always;
    }
    let mut s = path.to_string();
    if let Some(rest) = s.strip_prefix(PROJ_PLACEHOLDER) {
        s = format!("{}{}", ctx.proj_dir.to_string_lossy(), rest);
    }
    DepPath::Path(canonical_path(&scope_abspath(&s, ctx)))
}

/// Whether a resolved requirement still contains a deferred `$:build:$`.
pub fn has_deferred_build_dir(path: &Path) -> bool {
    path.to_string_lossy().contains(BUILD_PLACEHOLDER)
}

/// Resolve a deferred `$:build:$` component against the table of build dirs
/// recorded for visited directories. The directory owning the placeholder is
/// the parent of the path prefix before the placeholder.
pub fn resolve_build_dir(
    path: &Path,
    known_build_dirs: &HashMap<PathBuf, String>,
) -> Result<PathBuf> {
    let s = path.to_string_lossy();
    let Some(idx) = s.find(BUILD_PLACEHOLDER) else {
        return Ok(path.to_path_buf());
    };
    let (begin, rest) = s.split_at(idx);
    let end = &rest[BUILD_PLACEHOLDER.len()..];
    // The placeholder normally follows a separator, so the owning directory
    // is the prefix with that separator trimmed.
    let owner = if let Some(trimmed) = begin.strip_suffix('/') {
        if trimmed.is_empty() {
            PathBuf::from("/")
        } else {
            PathBuf::from(trimmed)
        }
    } else {
        Path::new(begin)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default()
    };
    match known_build_dirs.get(&owner) {
        Some(build_dir) => {
            let fixed = format!("{begin}{build_dir}{end}");
            let resolved = canonical_path(Path::new(&fixed));
            tracing::debug!(
                "Fixed {} in path: {} => {}",
                BUILD_PLACEHOLDER,
                s,
                resolved.display()
            );
            Ok(resolved)
        }
        None => Err(BuildError::new(
            ErrorKind::UnresolvedBuildDir,
            format!("Could not resolve {BUILD_PLACEHOLDER} for path {s}"),
        )),
    }
}

/// Resolve deferred build dirs across a set of dependency paths.
pub fn resolve_build_dirs(
    paths: impl IntoIterator<Item = DepPath>,
    known_build_dirs: &HashMap<PathBuf, String>,
) -> Result<Vec<DepPath>> {
    let mut out = Vec::new();
    for dep in paths {
        match dep {
            DepPath::Always => out.push(DepPath::Always),
            DepPath::Path(p) => {
                if has_deferred_build_dir(&p) {
                    out.push(DepPath::Path(resolve_build_dir(&p, known_build_dirs)?));
                } else {
                    out.push(DepPath::Path(p));
                }
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dir: &Path) -> PathContext {
        PathContext {
            dir: dir.to_path_buf(),
            proj_dir: dir.to_path_buf(),
            build_dir: "__build__".to_string(),
        }
    }

    #[test]
    fn test_normalize_lexical() {
        assert_eq!(
            normalize_lexical(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(normalize_lexical(Path::new("/..")), PathBuf::from("/"));
        assert_eq!(normalize_lexical(Path::new("a/../..")), PathBuf::from(".."));
    }

    #[test]
    fn test_canonical_path_tolerates_missing_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let root = canonical_path(tmp.path());
        let missing = root.join("no/such/dir/file.txt");
        assert_eq!(canonical_path(&missing), missing);
    }

    #[test]
    fn test_target_abspath_expands_placeholders() {
        let tmp = tempfile::tempdir().unwrap();
        let root = canonical_path(tmp.path());
        let c = ctx(&root);

        assert_eq!(target_abspath("out.txt", &c), root.join("out.txt"));
        assert_eq!(
            target_abspath("$:build:$/out.o", &c),
            root.join("__build__/out.o")
        );
        assert_eq!(
            target_abspath("$:proj:$/lib/a.c", &c),
            root.join("lib/a.c")
        );
    }

    #[test]
    fn test_require_abspath_defers_build_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let root = canonical_path(tmp.path());
        let c = ctx(&root);

        let dep = require_abspath("sub/$:build:$/gen.h", &c);
        let DepPath::Path(p) = &dep else {
            panic!("expected a path");
        };
        assert!(has_deferred_build_dir(p));

        assert_eq!(require_abspath(ALWAYS_BUILD, &c), DepPath::Always);
    }

    #[test]
    fn test_resolve_build_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let root = canonical_path(tmp.path());
        let c = ctx(&root);
        let dep = require_abspath("sub/$:build:$/gen.h", &c);
        let DepPath::Path(p) = dep else { panic!() };

        let mut known = HashMap::new();
        known.insert(root.join("sub"), "bld".to_string());
        assert_eq!(
            resolve_build_dir(&p, &known).unwrap(),
            root.join("sub/bld/gen.h")
        );

        let unknown = HashMap::new();
        let err = resolve_build_dir(&p, &unknown).unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnresolvedBuildDir);
    }
}
