use std::path::{Component, Path, PathBuf};

use crate::prelude::*;

#[cfg(test)]
#[path = "safe_path_tests.rs"]
mod tests;

/// Joins `rel` onto `root` and verifies the result stays inside `root`.
///
/// Every path crossing an external boundary (argv, environment, YAML content)
/// goes through here. Rejects any `rel` containing a `..` component before
/// resolution, and any result whose canonicalized form is not a descendant of
/// the canonicalized root.
pub fn join_confined(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return escape_err(rel);
    }
    for component in rel_path.components() {
        match component {
            Component::ParentDir => return escape_err(rel),
            Component::Prefix(_) | Component::RootDir => return escape_err(rel),
            _ => {}
        }
    }
    let joined = root.join(rel_path);
    confine(root, &joined)?;
    Ok(joined)
}

/// Verifies that `abs`, once symlinks are resolved, is a descendant of `root`.
/// The deepest existing ancestor of `abs` is canonicalized; the non-existing
/// remainder cannot introduce an escape since `..` components are rejected.
pub fn confine(root: &Path, abs: &Path) -> EmptyRes {
    let canonical_root = root.canonicalize()
        .with_context(|| format!("Cannot canonicalize repository root {root:?}"))?;

    let mut existing = abs;
    let mut remainder: Vec<&std::ffi::OsStr> = vec![];
    while !existing.exists() {
        if let Some(c) = existing.components().next_back() {
            match c {
                Component::Normal(name) => remainder.push(name),
                Component::ParentDir => return escape_err(&abs.to_string_lossy()),
                _ => {}
            }
        }
        existing = match existing.parent() {
            Some(p) if p.as_os_str().is_empty() => Path::new("."),
            Some(p) => p,
            None => return escape_err(&abs.to_string_lossy()),
        };
    }

    let mut canonical = existing.canonicalize()
        .with_context(|| format!("Cannot canonicalize {existing:?}"))?;
    for name in remainder.iter().rev() {
        canonical.push(name);
    }

    if !canonical.starts_with(&canonical_root) {
        return escape_err(&abs.to_string_lossy());
    }
    Ok(())
}

fn escape_err<T>(path: &str) -> Result<T> {
    Err(PipelineError::PathEscape { path: path.to_owned() }.into())
}
