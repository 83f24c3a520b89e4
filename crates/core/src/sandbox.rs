//! Path sandbox: every externally supplied path must resolve inside one of
//! the configured search roots.
//!
//! Symlinks and `..` components are resolved *before* the containment check,
//! so a link pointing outside a root is rejected even though its own path
//! looks in-bounds. A non-existent final component is allowed — its parent's
//! resolution must still lie under a root — so a cache file we are about to
//! create can be validated before it exists.

use std::path::{Component, Path, PathBuf};

use crate::config::Config;
use crate::error::{Result, RxError};

/// An ordered, non-empty set of resolved search roots, configured once at
/// startup.
#[derive(Clone, Debug)]
pub struct Sandbox {
    roots: Vec<PathBuf>,
}

impl Sandbox {
    /// Resolve and validate the given roots. An empty list falls back to the
    /// current working directory. Duplicates (after resolution) collapse.
    pub fn new(roots: &[PathBuf]) -> Result<Sandbox> {
        let candidates: Vec<PathBuf> = if roots.is_empty() {
            vec![std::env::current_dir()?]
        } else {
            roots.to_vec()
        };

        let mut resolved = Vec::with_capacity(candidates.len());
        for root in candidates {
            let canonical = root.canonicalize().map_err(|_| RxError::PathOutsideSandbox {
                path: format!("search root does not exist: {}", root.display()),
            })?;
            if !canonical.is_dir() {
                return Err(RxError::PathOutsideSandbox {
                    path: format!("search root is not a directory: {}", canonical.display()),
                });
            }
            if !resolved.contains(&canonical) {
                resolved.push(canonical);
            }
        }
        Ok(Sandbox { roots: resolved })
    }

    /// Build from the configured `RX_SEARCH_ROOTS` snapshot.
    pub fn from_config(config: &Config) -> Result<Sandbox> {
        Sandbox::new(&config.search_roots)
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Validate a path against the root set and return its resolved form.
    ///
    /// A relative path is interpreted against each root in turn; the first
    /// root whose resolution contains the candidate wins.
    pub fn validate(&self, path: &Path) -> Result<PathBuf> {
        for root in &self.roots {
            let candidate = if path.is_absolute() { path.to_path_buf() } else { root.join(path) };
            if let Some(resolved) = resolve_lenient(&candidate) {
                if resolved.starts_with(root) {
                    return Ok(resolved);
                }
            }
        }
        Err(RxError::PathOutsideSandbox { path: path.display().to_string() })
    }

    /// Validate a batch of paths; fails on the first offender.
    pub fn validate_all(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        paths.iter().map(|p| self.validate(p)).collect()
    }

    /// Containment check that never errors.
    pub fn is_within(&self, path: &Path) -> bool {
        self.validate(path).is_ok()
    }
}

/// Canonicalize a path, tolerating a missing final component: when the leaf
/// does not exist, its parent is canonicalized instead and the (lexically
/// cleaned) leaf re-appended. Returns `None` when even the parent cannot be
/// resolved.
fn resolve_lenient(path: &Path) -> Option<PathBuf> {
    if let Ok(resolved) = path.canonicalize() {
        return Some(resolved);
    }
    let cleaned = normalize_dots(path);
    let parent = cleaned.parent()?;
    let leaf = cleaned.file_name()?;
    let parent = parent.canonicalize().ok()?;
    Some(parent.join(leaf))
}

/// Lexically remove `.` and fold `..` so that a dangling path like
/// `/root/sub/../new.log` still resolves its intended parent.
fn normalize_dots(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sandbox_over(dir: &Path) -> Sandbox {
        Sandbox::new(&[dir.to_path_buf()]).unwrap()
    }

    #[test]
    fn accepts_file_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.log");
        fs::write(&file, "x").unwrap();
        let sb = sandbox_over(dir.path());
        let resolved = sb.validate(&file).unwrap();
        assert!(resolved.ends_with("a.log"));
    }

    #[test]
    fn accepts_relative_path_against_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("rel.log"), "x").unwrap();
        let sb = sandbox_over(dir.path());
        let resolved = sb.validate(Path::new("rel.log")).unwrap();
        assert!(resolved.ends_with("rel.log"));
    }

    #[test]
    fn rejects_dotdot_escape() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox_over(dir.path());
        let escape = dir.path().join("..").join("etc").join("passwd");
        assert!(matches!(sb.validate(&escape), Err(RxError::PathOutsideSandbox { .. })));
    }

    #[test]
    fn rejects_absolute_path_outside_roots() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox_over(dir.path());
        assert!(sb.validate(Path::new("/etc/passwd")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escaping_root() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("secret.txt");
        fs::write(&target, "s").unwrap();
        let link = dir.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();
        let sb = sandbox_over(dir.path());
        assert!(matches!(sb.validate(&link), Err(RxError::PathOutsideSandbox { .. })));
    }

    #[test]
    fn allows_nonexistent_leaf_with_valid_parent() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox_over(dir.path());
        let new_file = dir.path().join("not-yet.zst");
        let resolved = sb.validate(&new_file).unwrap();
        assert!(resolved.ends_with("not-yet.zst"));
    }

    #[test]
    fn rejects_nonexistent_leaf_with_escaping_parent() {
        let dir = tempfile::tempdir().unwrap();
        let sb = sandbox_over(dir.path());
        let escape = dir.path().join("..").join("not-yet.zst");
        assert!(sb.validate(&escape).is_err());
    }

    #[test]
    fn second_root_accepts_what_first_rejects() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let file = b.path().join("b.log");
        fs::write(&file, "x").unwrap();
        let sb = Sandbox::new(&[a.path().to_path_buf(), b.path().to_path_buf()]).unwrap();
        assert!(sb.validate(&file).is_ok());
    }

    #[test]
    fn empty_root_list_uses_cwd() {
        let sb = Sandbox::new(&[]).unwrap();
        assert_eq!(sb.roots().len(), 1);
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("missing");
        assert!(Sandbox::new(&[gone]).is_err());
    }
}
