//! Artifact specifications and resolution rules.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// How an artifact's location is determined from filesystem state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ResolutionRule {
    /// A single path that must exist.
    Fixed {
        /// The path.
        path: PathBuf,
    },
    /// The highest-numbered integer-named subdirectory of `root`.
    LatestNumbered {
        /// Directory containing numbered subdirectories.
        root: PathBuf,
    },
    /// A directory that must contain every entry in `entries`.
    RequiredSet {
        /// Directory the entries are relative to.
        root: PathBuf,
        /// Relative entries that must all exist.
        entries: Vec<PathBuf>,
    },
    /// A directory holding at least one entry.
    NonEmptyDirectory {
        /// The directory.
        path: PathBuf,
    },
}

impl fmt::Display for ResolutionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed { path } => write!(f, "{}", path.display()),
            Self::LatestNumbered { root } => write!(f, "{}/<latest>", root.display()),
            Self::RequiredSet { root, entries } => {
                let names: Vec<String> = entries.iter().map(|e| e.display().to_string()).collect();
                write!(f, "{}/{{{}}}", root.display(), names.join(","))
            }
            Self::NonEmptyDirectory { path } => write!(f, "{}/*", path.display()),
        }
    }
}

/// A named artifact a stage consumes or produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Logical name, e.g. "sparse model".
    pub logical_name: String,
    /// How to locate it.
    pub rule: ResolutionRule,
}

impl ArtifactSpec {
    /// Creates an artifact with an explicit rule.
    #[must_use]
    pub fn new(logical_name: impl Into<String>, rule: ResolutionRule) -> Self {
        Self {
            logical_name: logical_name.into(),
            rule,
        }
    }

    /// An artifact at a fixed path.
    #[must_use]
    pub fn fixed(logical_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(logical_name, ResolutionRule::Fixed { path: path.into() })
    }

    /// An artifact found as the latest numbered subdirectory of `root`.
    #[must_use]
    pub fn latest_numbered(logical_name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self::new(logical_name, ResolutionRule::LatestNumbered { root: root.into() })
    }

    /// A directory that must contain all of `entries`.
    #[must_use]
    pub fn required_set<I, P>(logical_name: impl Into<String>, root: impl Into<PathBuf>, entries: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self::new(
            logical_name,
            ResolutionRule::RequiredSet {
                root: root.into(),
                entries: entries.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// A directory that must not be empty.
    #[must_use]
    pub fn non_empty_directory(logical_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::new(logical_name, ResolutionRule::NonEmptyDirectory { path: path.into() })
    }
}

/// A successfully resolved artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedArtifact {
    /// Logical name from the [`ArtifactSpec`].
    pub logical_name: String,
    /// Concrete location.
    pub path: PathBuf,
}

impl ResolvedArtifact {
    /// Returns the resolved path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
