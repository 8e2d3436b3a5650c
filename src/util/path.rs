//! Path normalization and containment checks without filesystem access.

use std::path::{Component, Path, PathBuf};

/// Normalize a path by resolving `.` and `..` components without filesystem access.
pub fn normalize(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                components.pop();
            }
            Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}

/// Check if `path` is contained within `root` after normalization.
pub fn is_within(path: &Path, root: &Path) -> bool {
    normalize(path).starts_with(normalize(root))
}

/// Join a slash-separated logical name (e.g. a secret location) under `root`.
///
/// Returns `None` for empty names, absolute names, or names with `.`/`..`
/// segments, so the result always stays strictly inside `root`.
pub fn join_logical(root: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.starts_with('/') || name.contains('\\') {
        return None;
    }
    let mut out = root.to_path_buf();
    for segment in name.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return None;
        }
        out.push(segment);
    }
    if out == root || !is_within(&out, root) {
        return None;
    }
    Some(out)
}
