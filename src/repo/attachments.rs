use std::collections::BTreeSet;
use std::fs;

use walkdir::WalkDir;

use crate::prelude::*;
use crate::repo::{Repository, ATTACHMENTS_DIR};
use crate::utils::atomic;

#[cfg(test)]
#[path = "attachments_tests.rs"]
mod tests;

/// Repo-relative path of a content-addressed blob.
pub fn blob_rel_path(hash: &str) -> String {
    format!("{ATTACHMENTS_DIR}/{}/{hash}", &hash[..2])
}

pub fn blob_exists(repo: &Repository, hash: &str) -> bool {
    repo.attachments_dir().join(&hash[..2]).join(hash).is_file()
}

/// Stores decoded attachment bytes under their content hash. A blob that
/// already exists is never rewritten. Returns `(hash, newly_written)`.
pub fn store_blob(repo: &Repository, bytes: &[u8]) -> Result<(String, bool)> {
    let hash = hashing::hash_bytes(bytes);
    if blob_exists(repo, &hash) {
        return Ok((hash, false));
    }
    let target = repo.resolve(&blob_rel_path(&hash))?;
    atomic::create_dir_all(target.parent().context("Blob path has no parent")?)
        .map_err(|e| attachment_write_error(&e))?;
    atomic::write_file(&target, bytes)
        .map_err(|e| attachment_write_error(&e))?;
    Ok((hash, true))
}

fn attachment_write_error(e: &anyhow::Error) -> anyhow::Error {
    PipelineError::AttachmentWrite { reason: error_to_string(e) }.into()
}

/// All blob hashes present on disk, sorted.
pub fn list_blobs(repo: &Repository) -> Result<BTreeSet<String>> {
    let dir = repo.attachments_dir();
    let mut hashes = BTreeSet::new();
    if !dir.is_dir() {
        return Ok(hashes);
    }
    for entry in WalkDir::new(&dir).follow_links(false) {
        let entry = entry.context("Attachment walk failed")?;
        if entry.file_type().is_file() {
            hashes.insert(path_file_name(entry.path())?.to_owned());
        }
    }
    Ok(hashes)
}

/// Deletes one blob and prunes its two-hex-char parent directory if emptied.
pub fn remove_blob(repo: &Repository, hash: &str) -> EmptyRes {
    let path = repo.resolve(&blob_rel_path(hash))?;
    fs::remove_file(&path).with_context(|| format!("Cannot remove {path:?}"))?;
    if let Some(parent) = path.parent() {
        let is_empty = fs::read_dir(parent)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if is_empty {
            fs::remove_dir(parent).with_context(|| format!("Cannot prune {parent:?}"))?;
        }
    }
    Ok(())
}
