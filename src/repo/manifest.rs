use std::fs;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::prelude::*;
use crate::repo::{self, Repository};
use crate::utils::atomic;
use crate::utils::atomic::TMP_INFIX;

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod tests;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub file: String,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Decides whether a repo-relative path belongs in `files.yaml`.
///
/// Included: the marker, `summary.yaml`, `contacts.yaml`, and everything
/// under `calls/`, `sms/` and `attachments/`. The manifest pair itself, the
/// `rejected/` mirror, in-flight temp files and all other dotfiles stay out.
pub fn is_included(rel: &str) -> bool {
    if rel == repo::MANIFEST_FILENAME || rel == repo::MANIFEST_CHECKSUM_FILENAME {
        return false;
    }
    let filename = rel.rsplit('/').next().unwrap_or(rel);
    if filename.contains(TMP_INFIX) {
        return false;
    }
    if filename.starts_with('.') && rel != repo::MARKER_FILENAME {
        return false;
    }
    if rel == repo::MARKER_FILENAME
        || rel == repo::SUMMARY_FILENAME
        || rel == repo::CONTACTS_FILENAME {
        return true;
    }
    repo::CONTENT_DIRS.iter().any(|dir| rel.starts_with(&format!("{dir}/")))
}

/// Walks the repository and hashes every included file.
pub fn build_manifest(repo: &Repository) -> Result<Vec<ManifestEntry>> {
    let mut entries = vec![];
    for entry in WalkDir::new(repo.root()).follow_links(false) {
        let entry = entry.context("Repository walk failed")?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = repo.relativize(entry.path())?;
        // Dot-directories (and their content) are never manifest material.
        if rel != repo::MARKER_FILENAME && rel.split('/').any(|c| c.starts_with('.')) {
            continue;
        }
        if !is_included(&rel) {
            continue;
        }
        let (sha256, size_bytes) = hashing::hash_file(entry.path())?;
        entries.push(ManifestEntry { file: rel, sha256, size_bytes });
    }
    entries.sort_by(|a, b| a.file.cmp(&b.file));
    Ok(entries)
}

/// Publishes `files.yaml` and its checksum sibling atomically, manifest
/// first: readers that see the new checksum see the new manifest.
pub fn write_manifest(repo: &Repository, entries: &[ManifestEntry]) -> EmptyRes {
    let yaml = repo::to_canonical_yaml(&entries)?;
    let checksum = format!("{}\n", hashing::hash_bytes(&yaml));
    atomic::write_all(&[
        (repo.manifest_path(), yaml),
        (repo.manifest_checksum_path(), checksum.into_bytes()),
    ])
}

pub fn read_manifest(repo: &Repository) -> Result<Vec<ManifestEntry>> {
    let path = repo.manifest_path();
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Cannot read manifest {path:?}"))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Manifest {path:?} is not valid YAML"))
}

pub fn read_manifest_checksum(repo: &Repository) -> Result<String> {
    let path = repo.manifest_checksum_path();
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Cannot read manifest checksum {path:?}"))?;
    Ok(content.trim().to_owned())
}
