//! On-disk layout under the data directory and lexical path safety.
//!
//! Every path built from a repository name, build id, checkout path, result
//! filename or coverage report goes through this module. Paths are cleaned
//! lexically (no filesystem access) and then checked for containment.

use std::path::{Path, PathBuf};

use crate::error::{DingError, Result};

/// Lexically clean a slash-separated path: collapse repeated separators,
/// drop `.` elements, resolve `..` against preceding elements. A rooted
/// path never climbs above `/`. An empty result becomes `.`.
pub fn clean(path: &str) -> String {
    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for elem in path.split('/') {
        match elem {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if rooted => {}
                _ => parts.push(".."),
            },
            e => parts.push(e),
        }
    }
    let joined = parts.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Resolve `path` against `base` (unless already absolute), clean it, and
/// require the result to be a strict descendant of `base`.
pub fn resolve_within(base: &Path, path: &str) -> Option<PathBuf> {
    let base = clean(&base.to_string_lossy());
    let joined = if path.starts_with('/') {
        clean(path)
    } else {
        clean(&format!("{base}/{path}"))
    };
    let prefix = if base == "/" {
        "/".to_string()
    } else {
        format!("{base}/")
    };
    if joined.starts_with(&prefix) && joined.len() > prefix.len() {
        Some(PathBuf::from(joined))
    } else {
        None
    }
}

/// Repository names become single path elements.
pub fn validate_repo_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(DingError::user(format!(
            "invalid repository name {name:?}: use letters, digits, '-', '_' and '.'"
        )))
    }
}

/// Checkout paths are relative, clean, and do not start or end with a slash.
pub fn validate_checkout_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(DingError::user("checkout path cannot be empty"));
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(DingError::user(
            "checkout path cannot start or end with a slash",
        ));
    }
    if clean(path) != path || path.split('/').any(|e| e == "..") {
        return Err(DingError::user(format!(
            "checkout path {path:?} is not a clean relative path"
        )));
    }
    Ok(())
}

/// Directory layout under the configured data directory.
#[derive(Clone, Debug)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database(&self) -> PathBuf {
        self.root.join("ding.db")
    }

    pub fn builds(&self) -> PathBuf {
        self.root.join("build")
    }

    pub fn repo_builds(&self, repo: &str) -> Result<PathBuf> {
        validate_repo_name(repo)?;
        Ok(self.builds().join(repo))
    }

    pub fn build_dir(&self, repo: &str, build_id: i64) -> Result<PathBuf> {
        if build_id <= 0 {
            return Err(DingError::user(format!("invalid build id {build_id}")));
        }
        Ok(self.repo_builds(repo)?.join(build_id.to_string()))
    }

    pub fn checkout_dir(&self, repo: &str, build_id: i64, checkout_path: &str) -> Result<PathBuf> {
        validate_checkout_path(checkout_path)?;
        Ok(self.build_dir(repo, build_id)?.join("checkout").join(checkout_path))
    }

    pub fn shared_home(&self, repo: &str) -> Result<PathBuf> {
        validate_repo_name(repo)?;
        Ok(self.root.join("home").join(repo))
    }

    pub fn repo_releases(&self, repo: &str) -> Result<PathBuf> {
        validate_repo_name(repo)?;
        Ok(self.root.join("release").join(repo))
    }

    pub fn release_dir(&self, repo: &str, build_id: i64) -> Result<PathBuf> {
        Ok(self.repo_releases(repo)?.join(build_id.to_string()))
    }

    /// Home directory for a build: shared per repository when the repository
    /// has a fixed uid, inside the build directory otherwise.
    pub fn home_dir(&self, repo: &str, build_id: i64, shared: bool) -> Result<PathBuf> {
        if shared {
            self.shared_home(repo)
        } else {
            Ok(self.build_dir(repo, build_id)?.join("home"))
        }
    }
}

/// Disk usage of a tree: file sizes plus 2 KiB of overhead per entry.
/// Symlinks are not followed. Missing trees count as zero.
pub fn disk_usage(path: &Path) -> u64 {
    const ENTRY_OVERHEAD: u64 = 2 * 1024;

    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return 0;
    };
    let mut total = ENTRY_OVERHEAD;
    if meta.is_file() {
        total += meta.len();
    } else if meta.is_dir() {
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                total += disk_usage(&entry.path());
            }
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_matches_lexical_rules() {
        assert_eq!(clean(""), ".");
        assert_eq!(clean("a//b/./c/"), "a/b/c");
        assert_eq!(clean("a/../../b"), "../b");
        assert_eq!(clean("/../x"), "/x");
        assert_eq!(clean("/a/b/../.."), "/");
        assert_eq!(clean("./myfile"), "myfile");
    }

    #[test]
    fn resolve_within_requires_strict_descendant() {
        let base = Path::new("/data/build/r/1/checkout/r");
        assert_eq!(
            resolve_within(base, "bin/tool"),
            Some(PathBuf::from("/data/build/r/1/checkout/r/bin/tool"))
        );
        assert_eq!(resolve_within(base, "."), None);
        assert_eq!(resolve_within(base, "../r2/x"), None);
        assert!(resolve_within(base, "../r/x/../../r/y").is_some());
        assert_eq!(resolve_within(base, "/etc/passwd"), None);
        assert_eq!(
            resolve_within(base, "/data/build/r/1/checkout/r/out"),
            Some(PathBuf::from("/data/build/r/1/checkout/r/out"))
        );
        // prefix match on a sibling name must not count
        assert_eq!(resolve_within(base, "/data/build/r/1/checkout/rx"), None);
    }

    #[test]
    fn repo_names_and_checkout_paths() {
        assert!(validate_repo_name("ding-1.x_y").is_ok());
        assert!(validate_repo_name("").is_err());
        assert!(validate_repo_name("..").is_err());
        assert!(validate_repo_name("a/b").is_err());

        assert!(validate_checkout_path("src/ding").is_ok());
        assert!(validate_checkout_path("/abs").is_err());
        assert!(validate_checkout_path("trailing/").is_err());
        assert!(validate_checkout_path("a/../b").is_err());
        assert!(validate_checkout_path("..").is_err());
    }

    #[test]
    fn layout() {
        let data = DataDir::new("/srv/ding/data");
        assert_eq!(
            data.build_dir("t0", 7).unwrap(),
            PathBuf::from("/srv/ding/data/build/t0/7")
        );
        assert_eq!(
            data.home_dir("t0", 7, true).unwrap(),
            PathBuf::from("/srv/ding/data/home/t0")
        );
        assert_eq!(
            data.home_dir("t0", 7, false).unwrap(),
            PathBuf::from("/srv/ding/data/build/t0/7/home")
        );
        assert!(data.build_dir("", 7).is_err());
        assert!(data.build_dir("t0", 0).is_err());
    }

    #[test]
    fn disk_usage_counts_entries_and_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"abc").unwrap();
        std::fs::create_dir(dir.path().join("d")).unwrap();
        // root dir + file + subdir
        assert_eq!(disk_usage(dir.path()), 3 * 2048 + 3);
        assert_eq!(disk_usage(&dir.path().join("missing")), 0);
    }
}
