//! Read-only filesystem inspection for stage artifacts.
//!
//! Nothing in this module creates, deletes or modifies files.

use super::{ArtifactSpec, ResolutionRule, ResolvedArtifact};
use crate::errors::{LocatorError, MissingArtifactError, NotFoundError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Returns the immediate subdirectory of `root` with the largest
/// non-negative integer name.
///
/// Names that do not parse as integers (`"abc"`, `"-1"`, `"1a"`) are ignored.
/// Comparison is numeric, so `"10"` wins over `"2"`.
pub fn latest_numbered_subdirectory(root: &Path) -> Result<PathBuf, NotFoundError> {
    let not_found = || NotFoundError::new(root, "numbered model subdirectory");

    let entries = fs::read_dir(root).map_err(|_| not_found())?;

    let latest = entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            if !name.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            name.parse::<u64>().ok().map(|index| (index, entry.path()))
        })
        .max_by_key(|(index, _)| *index);

    match latest {
        Some((index, path)) => {
            trace!(root = %root.display(), index, "Resolved latest numbered subdirectory");
            Ok(path)
        }
        None => Err(not_found()),
    }
}

/// Checks that every path exists, reporting all missing ones at once.
pub fn require_paths<I, P>(paths: I) -> Result<(), MissingArtifactError>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let missing: Vec<PathBuf> = paths
        .into_iter()
        .filter(|p| !p.as_ref().exists())
        .map(|p| p.as_ref().to_path_buf())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(MissingArtifactError { missing })
    }
}

/// Resolves an artifact specification against current filesystem state.
pub fn resolve(spec: &ArtifactSpec) -> Result<ResolvedArtifact, LocatorError> {
    let path = match &spec.rule {
        ResolutionRule::Fixed { path } => {
            require_paths([path])?;
            path.clone()
        }
        ResolutionRule::LatestNumbered { root } => latest_numbered_subdirectory(root)?,
        ResolutionRule::RequiredSet { root, entries } => {
            let mut required = vec![root.clone()];
            required.extend(entries.iter().map(|e| root.join(e)));
            require_paths(&required)?;
            root.clone()
        }
        ResolutionRule::NonEmptyDirectory { path } => {
            let has_entries = fs::read_dir(path)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
            if !has_entries {
                return Err(NotFoundError::new(path, "entries").into());
            }
            path.clone()
        }
    };

    Ok(ResolvedArtifact {
        logical_name: spec.logical_name.clone(),
        path,
    })
}

/// Resolves every spec, stopping at the first failure.
///
/// Returns the failing spec alongside the error so callers can name it.
pub fn resolve_all<'a, I>(specs: I) -> Result<Vec<ResolvedArtifact>, (&'a ArtifactSpec, LocatorError)>
where
    I: IntoIterator<Item = &'a ArtifactSpec>,
{
    specs
        .into_iter()
        .map(|spec| resolve(spec).map_err(|e| (spec, e)))
        .collect()
}

/// Sibling path an artifact is written to before being renamed into place.
///
/// The name never resolves as the artifact itself, so a half-written file
/// cannot satisfy a completion check.
#[must_use]
pub fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.partial"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn make_dirs(root: &Path, names: &[&str]) {
        for name in names {
            fs::create_dir_all(root.join(name)).unwrap();
        }
    }

    #[test]
    fn test_staging_path_is_a_hidden_sibling() {
        assert_eq!(
            staging_path(Path::new("ws/dense/fused_fixed.ply")),
            PathBuf::from("ws/dense/.fused_fixed.ply.partial")
        );
    }

    #[test]
    fn test_latest_numbered_is_numeric_not_lexicographic() {
        let tmp = TempDir::new().unwrap();
        make_dirs(tmp.path(), &["0", "2", "10", "abc"]);

        let latest = latest_numbered_subdirectory(tmp.path()).unwrap();
        assert_eq!(latest, tmp.path().join("10"));
    }

    #[test]
    fn test_latest_numbered_ignores_files_and_signed_names() {
        let tmp = TempDir::new().unwrap();
        make_dirs(tmp.path(), &["3", "-7", "+9"]);
        fs::write(tmp.path().join("42"), b"not a dir").unwrap();

        let latest = latest_numbered_subdirectory(tmp.path()).unwrap();
        assert_eq!(latest, tmp.path().join("3"));
    }

    #[test]
    fn test_latest_numbered_missing_root() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("nope");

        let err = latest_numbered_subdirectory(&root).unwrap_err();
        assert_eq!(err.root, root);
    }

    #[test]
    fn test_latest_numbered_no_candidates() {
        let tmp = TempDir::new().unwrap();
        make_dirs(tmp.path(), &["abc", "model"]);

        assert!(latest_numbered_subdirectory(tmp.path()).is_err());
    }

    #[test]
    fn test_require_paths_reports_every_missing_path() {
        let tmp = TempDir::new().unwrap();
        make_dirs(tmp.path(), &["images"]);
        let a = tmp.path().join("images");
        let b = tmp.path().join("sparse");
        let c = tmp.path().join("stereo");

        let err = require_paths([&a, &b, &c]).unwrap_err();
        assert_eq!(err.missing, vec![b, c]);
    }

    #[test]
    fn test_require_paths_all_present() {
        let tmp = TempDir::new().unwrap();
        make_dirs(tmp.path(), &["images", "sparse"]);
        assert!(require_paths([tmp.path().join("images"), tmp.path().join("sparse")]).is_ok());
    }

    #[test]
    fn test_resolve_required_set() {
        let tmp = TempDir::new().unwrap();
        let dense = tmp.path().join("dense");
        make_dirs(&dense, &["images", "sparse"]);

        let spec = ArtifactSpec::required_set("dense workspace", &dense, ["images", "sparse", "stereo"]);
        match resolve(&spec).unwrap_err() {
            LocatorError::Missing(err) => assert_eq!(err.missing, vec![dense.join("stereo")]),
            other => panic!("unexpected error: {other:?}"),
        }

        make_dirs(&dense, &["stereo"]);
        let resolved = resolve(&spec).unwrap();
        assert_eq!(resolved.path, dense);
        assert_eq!(resolved.logical_name, "dense workspace");
    }

    #[test]
    fn test_resolve_non_empty_directory() {
        let tmp = TempDir::new().unwrap();
        let depth_maps = tmp.path().join("depth_maps");
        let spec = ArtifactSpec::non_empty_directory("depth maps", &depth_maps);

        assert!(matches!(resolve(&spec), Err(LocatorError::NotFound(_))));
        make_dirs(tmp.path(), &["depth_maps"]);
        assert!(resolve(&spec).is_err());

        fs::write(depth_maps.join("a.jpg.geometric.bin"), b"").unwrap();
        assert_eq!(resolve(&spec).unwrap().path, depth_maps);
    }

    #[test]
    fn test_resolve_is_read_only() {
        let tmp = TempDir::new().unwrap();
        let spec = ArtifactSpec::latest_numbered("sparse model", tmp.path().join("reconstruction"));

        assert!(resolve(&spec).is_err());
        assert!(!tmp.path().join("reconstruction").exists());
    }

    #[test]
    fn test_resolve_all_names_failing_spec() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.ply"), b"ply").unwrap();
        let specs = vec![
            ArtifactSpec::fixed("a", tmp.path().join("a.ply")),
            ArtifactSpec::fixed("b", tmp.path().join("b.ply")),
        ];

        let (spec, _) = resolve_all(&specs).unwrap_err();
        assert_eq!(spec.logical_name, "b");
    }
}
