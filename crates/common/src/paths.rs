use std::io;
use std::path::{Component, Path, PathBuf};

/// Lexically normalise a path: resolve `.` and `..` without touching
/// the filesystem. Used for fingerprint canonicalisation and as the
/// first step of workspace confinement.
pub fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::RootDir => normalized.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
        }
    }

    if normalized.as_os_str().is_empty() {
        normalized.push(".");
    }

    normalized
}

/// Resolve `candidate` relative to `root`, refusing traversal outside
/// the root. Path-kind tool arguments go through this gate; an escape
/// surfaces to the caller as `forbidden`.
pub fn resolve_within_root(root: &Path, candidate: &Path) -> io::Result<PathBuf> {
    let root_norm = normalize(root);
    let combined = if candidate.is_absolute() {
        normalize(candidate)
    } else {
        normalize(&root_norm.join(candidate))
    };

    if !combined.starts_with(&root_norm) {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!(
                "path {} escapes workspace {}",
                combined.display(),
                root_norm.display()
            ),
        ));
    }

    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_dot_segments() {
        assert_eq!(
            normalize(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(normalize(Path::new("")), PathBuf::from("."));
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize(Path::new("/x/../y/./z"));
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn resolve_within_root_accepts_children() {
        let resolved = resolve_within_root(Path::new("/work"), Path::new("scans/out.xml"))
            .expect("child path should resolve");
        assert_eq!(resolved, PathBuf::from("/work/scans/out.xml"));
    }

    #[test]
    fn resolve_within_root_rejects_escape() {
        let err = resolve_within_root(Path::new("/work"), Path::new("../etc/passwd"))
            .expect_err("escape must be refused");
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn resolve_within_root_rejects_absolute_outside() {
        assert!(resolve_within_root(Path::new("/work"), Path::new("/etc/passwd")).is_err());
    }
}
