//! Path helpers. Paths are absolute, `/`-separated, without empty segments
//! or a trailing slash. `/` is the implicit root.

use crate::error::{CoordError, CoordResult};

pub const ROOT: &str = "/";

pub fn validate(path: &str) -> CoordResult<()> {
    if path == ROOT {
        return Ok(());
    }
    if !path.starts_with('/') {
        return Err(CoordError::invalid(path, "must be absolute"));
    }
    if path.ends_with('/') {
        return Err(CoordError::invalid(path, "trailing slash"));
    }
    for segment in path[1..].split('/') {
        match segment {
            "" => return Err(CoordError::invalid(path, "empty segment")),
            "." | ".." => return Err(CoordError::invalid(path, "relative segment")),
            _ => {}
        }
    }
    Ok(())
}

/// Parent of `path`, or `None` for the root.
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

/// Last segment of `path`.
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn join(base: &str, name: &str) -> String {
    if base == ROOT {
        format!("/{name}")
    } else {
        format!("{base}/{name}")
    }
}

/// Proper ancestors of `path`, outermost first, excluding the root.
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

/// Prefix shared by every descendant of `path`.
pub(crate) fn descendant_prefix(path: &str) -> String {
    if path == ROOT {
        ROOT.to_string()
    } else {
        format!("{path}/")
    }
}
