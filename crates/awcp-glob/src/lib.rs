// SPDX-License-Identifier: MIT OR Apache-2.0
//! awcp-glob
#![deny(unsafe_code)]
//!
//! Path selection for delegated resources: include/exclude glob pairs,
//! the conventional skip-directory list, and the sensitive-path matcher
//! used by the admission scan.
//!
//! Exclude wins over include; empty pattern lists mean "no constraint".
//! The admission scan and the transport adapters consult the same rules,
//! so a path admitted is exactly a path shipped.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Outcome of evaluating a path against a resource's selection rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionDecision {
    /// Path passes both filters and is a transfer candidate.
    Selected,
    /// Path matched an exclude pattern.
    ExcludedByPattern,
    /// Includes were specified and none matched.
    NotIncluded,
}

impl SelectionDecision {
    /// Returns `true` only for [`SelectionDecision::Selected`].
    #[must_use]
    pub fn is_selected(self) -> bool {
        matches!(self, Self::Selected)
    }
}

/// Compiled include/exclude rules for one resource.
#[derive(Debug, Clone)]
pub struct SelectionRules {
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
}

impl SelectionRules {
    /// Compile a resource's pattern lists into a reusable matcher.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid pattern.
    pub fn compile(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: compile_globset(include)?,
            exclude: compile_globset(exclude)?,
        })
    }

    /// Rules that select everything.
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            include: None,
            exclude: None,
        }
    }

    /// Evaluate a path relative to the resource root.
    #[must_use]
    pub fn decide(&self, candidate: &Path) -> SelectionDecision {
        if self
            .exclude
            .as_ref()
            .is_some_and(|set| set.is_match(candidate))
        {
            return SelectionDecision::ExcludedByPattern;
        }
        if self
            .include
            .as_ref()
            .is_some_and(|set| !set.is_match(candidate))
        {
            return SelectionDecision::NotIncluded;
        }
        SelectionDecision::Selected
    }

    /// String-slice convenience for [`decide`](Self::decide).
    #[must_use]
    pub fn decide_str(&self, candidate: &str) -> SelectionDecision {
        self.decide(Path::new(candidate))
    }
}

fn compile_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut b = GlobSetBuilder::new();
    for p in patterns {
        b.add(Glob::new(p).with_context(|| format!("invalid glob: {p}"))?);
    }
    Ok(Some(b.build()?))
}

// ---------------------------------------------------------------------------
// Conventional skip list
// ---------------------------------------------------------------------------

/// Directory names never shipped, regardless of selection rules:
/// version-control metadata and dependency/build caches.
pub const SKIP_DIR_NAMES: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
];

/// Returns `true` if `name` is on the conventional skip list.
#[must_use]
pub fn is_skipped_dir(name: &str) -> bool {
    SKIP_DIR_NAMES.contains(&name)
}

// ---------------------------------------------------------------------------
// Sensitive paths
// ---------------------------------------------------------------------------

/// Default patterns for files that should never leave the Delegator:
/// dotenv files, private keys, and cloud credential stores.
pub const DEFAULT_SENSITIVE_PATTERNS: &[&str] = &[
    "**/.env",
    "**/.env.*",
    "**/*.pem",
    "**/*.key",
    "**/id_rsa",
    "**/id_ed25519",
    "**/.aws/credentials",
    "**/.config/gcloud/**",
    "**/.netrc",
];

/// Matches relative paths against a sensitive-path pattern list.
#[derive(Debug, Clone)]
pub struct SensitiveMatcher {
    patterns: Vec<String>,
    set: Option<GlobSet>,
}

impl SensitiveMatcher {
    /// Compile a custom pattern list.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid pattern.
    pub fn compile(patterns: &[String]) -> Result<Self> {
        Ok(Self {
            patterns: patterns.to_vec(),
            set: compile_globset(patterns)?,
        })
    }

    /// Matcher over [`DEFAULT_SENSITIVE_PATTERNS`].
    #[must_use]
    pub fn default_set() -> Self {
        let patterns: Vec<String> = DEFAULT_SENSITIVE_PATTERNS
            .iter()
            .map(|p| (*p).to_string())
            .collect();
        // The defaults are static and known-valid.
        Self::compile(&patterns).unwrap_or(Self {
            patterns,
            set: None,
        })
    }

    /// The pattern that matched `candidate`, if any.
    #[must_use]
    pub fn first_match(&self, candidate: &Path) -> Option<&str> {
        let set = self.set.as_ref()?;
        let matches = set.matches(candidate);
        matches
            .first()
            .and_then(|i| self.patterns.get(*i))
            .map(String::as_str)
    }

    /// Returns `true` if `candidate` matches any pattern.
    #[must_use]
    pub fn is_sensitive(&self, candidate: &Path) -> bool {
        self.first_match(candidate).is_some()
    }
}
