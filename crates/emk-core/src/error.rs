//! Build-error taxonomy
//!
//! Every failure the engine surfaces carries a [`ErrorKind`], a primary
//! message, and a list of pre-formatted "extra info" lines (rule declaration
//! sites, per-target explanations). The extra lines are rendered verbatim,
//! indented, below the primary message.

use std::fmt;
use std::panic::Location;

use thiserror::Error;

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Classification of a build failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Two rules claim the same product path.
    DuplicateRule,
    /// An alias path was declared twice, or collides with a rule product.
    DuplicateAlias,
    /// A `$:build:$` reference could not be resolved at reconciliation.
    UnresolvedBuildDir,
    /// A non-virtual product was not on disk after its rule ran.
    MissingProduct,
    /// Examined targets remained unbuilt after the phase loop exited.
    UnbuildableTargets,
    /// An explicit target matches no rule, alias, or existing file.
    UnknownExplicitTarget,
    /// A rule body returned an error.
    RuleExecutionFailure,
    /// An error inside a build description, `do_later`, `do_prebuild`,
    /// or `do_postbuild` function.
    ConfigurationFailure,
    /// The build was interrupted by a signal.
    Interrupted,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DuplicateRule => "duplicate rule",
            Self::DuplicateAlias => "duplicate alias",
            Self::UnresolvedBuildDir => "unresolved build dir",
            Self::MissingProduct => "missing product",
            Self::UnbuildableTargets => "unbuildable targets",
            Self::UnknownExplicitTarget => "unknown explicit target",
            Self::RuleExecutionFailure => "rule execution failure",
            Self::ConfigurationFailure => "configuration failure",
            Self::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

/// A build failure with attached context lines.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BuildError {
    /// What class of failure this is.
    pub kind: ErrorKind,
    message: String,
    extra_info: Vec<String>,
}

impl BuildError {
    /// Create an error with no extra info.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            extra_info: Vec::new(),
        }
    }

    /// Create an error with pre-formatted context lines.
    pub fn with_info(
        kind: ErrorKind,
        message: impl Into<String>,
        extra_info: Vec<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            extra_info,
        }
    }

    /// The primary message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The pre-formatted context lines.
    pub fn extra_info(&self) -> &[String] {
        &self.extra_info
    }

    /// Append more context lines.
    pub fn push_info(&mut self, line: impl Into<String>) {
        self.extra_info.push(line.into());
    }

    /// Render the message plus indented extra-info lines.
    pub fn render(&self) -> String {
        let mut out = self.message.clone();
        for line in &self.extra_info {
            out.push('\n');
            out.push_str("    ");
            out.push_str(&line.replace('\n', "\n    "));
        }
        out
    }
}

/// Convert a user error (from a rule body or configuration closure) into
/// extra-info lines, one per cause in the chain.
pub(crate) fn anyhow_info(err: &anyhow::Error) -> Vec<String> {
    err.chain().map(|cause| cause.to_string()).collect()
}

/// The source location at which a rule or alias was declared.
///
/// Captured with `#[track_caller]` on the control-surface operations; rendered
/// into error extra-info so a failing rule can be traced back to the build
/// description that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Origin {
    file: &'static str,
    line: u32,
    column: u32,
}

impl Origin {
    /// Capture the caller's location.
    #[track_caller]
    pub fn here() -> Self {
        let loc = Location::caller();
        Self {
            file: loc.file(),
            line: loc.line(),
            column: loc.column(),
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} line {}", self.file, self.line)
    }
}

/// Extra-info lines describing a rule's declaration site.
pub(crate) fn rule_origin_info(origin: &Origin) -> Vec<String> {
    vec![
        "Rule definition:".to_string(),
        format!("    declared at {origin}"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_indents_extra_info() {
        let err = BuildError::with_info(
            ErrorKind::MissingProduct,
            "out.o should have been produced by the rule",
            vec!["Rule definition:".to_string(), "declared at x.rs line 3".to_string()],
        );
        let rendered = err.render();
        assert!(rendered.starts_with("out.o should have been produced"));
        assert!(rendered.contains("\n    Rule definition:"));
        assert!(rendered.contains("\n    declared at x.rs line 3"));
    }

    #[test]
    fn test_origin_captures_caller() {
        let origin = Origin::here();
        assert!(origin.to_string().contains("error.rs"));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::UnresolvedBuildDir.to_string(), "unresolved build dir");
        assert_eq!(ErrorKind::Interrupted.to_string(), "interrupted");
    }
}
