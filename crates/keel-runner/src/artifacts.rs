//! Artifact pattern matching on the local filesystem.

use crate::runner::CollectedFile;
use globset::{GlobBuilder, GlobMatcher};
use keel_core::{Error, Result};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

const GLOB_META: &[char] = &['*', '?', '[', ']', '{', '}'];

/// Collect files under `root` matching `pattern`, sorted by path.
///
/// `*` does not cross directory boundaries; use `**` for that.
pub fn collect(root: &Path, pattern: &str, max_bytes: u64) -> Result<Vec<CollectedFile>> {
    let pattern = pattern.trim_start_matches("./");

    if !pattern.contains(GLOB_META) {
        let path = root.join(pattern);
        return if path.is_file() {
            Ok(vec![read(&path, pattern.to_string(), max_bytes)?])
        } else {
            Ok(Vec::new())
        };
    }

    let matcher = compile(pattern)?;
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).min_depth(1) {
        let entry = entry.map_err(|e| {
            Error::Dispatch(format!("failed to scan {}: {e}", root.display()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if matcher.is_match(&relative) {
            files.push((relative, entry.into_path()));
        }
    }
    files.sort();

    files
        .into_iter()
        .map(|(relative, path)| read(&path, relative, max_bytes))
        .collect()
}

fn compile(pattern: &str) -> Result<GlobMatcher> {
    GlobBuilder::new(pattern)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher())
        .map_err(|e| Error::Dispatch(format!("invalid artifact pattern `{pattern}`: {e}")))
}

fn read(path: &Path, relative: String, max_bytes: u64) -> Result<CollectedFile> {
    let size = fs::metadata(path)?.len();
    if size > max_bytes {
        return Err(Error::Dispatch(format!(
            "artifact `{relative}` is {size} bytes, over the {max_bytes} byte limit"
        )));
    }
    Ok(CollectedFile {
        path: relative,
        data: fs::read(path)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("target/release")).unwrap();
        fs::write(dir.path().join("Cargo.lock"), "lock").unwrap();
        fs::write(dir.path().join("target/release/keel"), "bin").unwrap();
        fs::write(dir.path().join("target/release/keel.d"), "deps").unwrap();
        fs::write(dir.path().join("target/notes.txt"), "notes").unwrap();
        dir
    }

    fn paths(files: &[CollectedFile]) -> Vec<&str> {
        files.iter().map(|f| f.path.as_str()).collect()
    }

    #[test]
    fn test_literal_path() {
        let dir = tree();
        let files = collect(dir.path(), "Cargo.lock", u64::MAX).unwrap();
        assert_eq!(paths(&files), vec!["Cargo.lock"]);
        assert_eq!(files[0].data, b"lock");

        assert!(collect(dir.path(), "missing.txt", u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_star_does_not_cross_directories() {
        let dir = tree();
        let files = collect(dir.path(), "target/*", u64::MAX).unwrap();
        assert_eq!(paths(&files), vec!["target/notes.txt"]);

        let files = collect(dir.path(), "target/**/keel*", u64::MAX).unwrap();
        assert_eq!(paths(&files), vec!["target/release/keel", "target/release/keel.d"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_file_matches_literal_and_glob() {
        let dir = tree();
        fs::write(dir.path().join("real.lock"), "linked").unwrap();
        fs::create_dir(dir.path().join("dist")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real.lock"), dir.path().join("dist/app.lock"))
            .unwrap();

        let literal = collect(dir.path(), "dist/app.lock", u64::MAX).unwrap();
        let glob = collect(dir.path(), "dist/*.lock", u64::MAX).unwrap();
        assert_eq!(paths(&literal), vec!["dist/app.lock"]);
        assert_eq!(paths(&glob), vec!["dist/app.lock"]);
        assert_eq!(glob[0].data, b"linked");
    }

    #[test]
    fn test_size_limit() {
        let dir = tree();
        let err = collect(dir.path(), "./Cargo.lock", 2).unwrap_err();
        assert!(matches!(err, Error::Dispatch(_)));
    }
}
