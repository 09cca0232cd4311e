//! Hierarchical node paths.
//!
//! Paths are absolute, '/'-delimited and never end with a slash (except the
//! root itself). Empty segments and `.`/`..` segments are rejected.

use crate::error::CoordError;
use crate::Result;

/// The root path.
pub const ROOT: &str = "/";

/// Validate a node path.
pub fn validate(path: &str) -> Result<()> {
    let invalid = |reason| {
        Err(CoordError::InvalidPath {
            path: path.to_string(),
            reason,
        })
    };

    if path.is_empty() {
        return invalid("path is empty");
    }
    if !path.starts_with('/') {
        return invalid("path must start with '/'");
    }
    if path == ROOT {
        return Ok(());
    }
    if path.ends_with('/') {
        return invalid("path must not end with '/'");
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return invalid("empty path segment"),
            "." | ".." => return invalid("relative path segment"),
            s if s.chars().any(char::is_control) => return invalid("control character"),
            _ => {}
        }
    }
    Ok(())
}

/// Parent of a path, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Last segment of a path (empty for the root).
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Join a parent path and a child name.
pub fn join(parent: &str, child: &str) -> String {
    if parent == ROOT {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// All strict ancestors of a path, nearest to the root first, root excluded.
pub fn ancestors(path: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut current = parent(path);
    while let Some(p) = current {
        if p == ROOT {
            break;
        }
        out.push(p);
        current = parent(p);
    }
    out.reverse();
    out
}

/// Whether `path` is `root` or lies below it.
pub fn is_within(path: &str, root: &str) -> bool {
    if root == ROOT {
        return true;
    }
    path == root
        || (path.len() > root.len() && path.starts_with(root) && path.as_bytes()[root.len()] == b'/')
}

/// Depth below the root (`/` is 0, `/a` is 1).
pub fn depth(path: &str) -> usize {
    if path == ROOT {
        0
    } else {
        path.matches('/').count()
    }
}
