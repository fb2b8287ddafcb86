use std::fs;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::prelude::*;

#[cfg(test)]
#[path = "atomic_tests.rs"]
mod tests;

pub const TMP_INFIX: &str = ".tmp-";
const BAK_INFIX: &str = ".bak-";

const FILE_MODE: u32 = 0o600;
const DIR_MODE: u32 = 0o750;

/// Writes `bytes` to `target` via a same-directory temp file, fsync, rename,
/// then fsync of the parent directory. The temp file is removed on any error.
pub fn write_file(target: &Path, bytes: &[u8]) -> EmptyRes {
    let tmp = TempTarget::stage(target, bytes)?;
    tmp.publish()?;
    sync_parent_dir(target)
}

/// All-or-nothing publication of a set of files: every temp is staged first,
/// then renames happen in sequence. A mid-sequence rename failure triggers a
/// best-effort revert of the files already renamed, restored from `.bak-`
/// copies taken just before each rename.
pub fn write_all(targets: &[(PathBuf, Vec<u8>)]) -> EmptyRes {
    let mut staged = Vec::with_capacity(targets.len());
    for (target, bytes) in targets {
        staged.push(TempTarget::stage(target, bytes)?);
    }

    let mut published: Vec<PathBuf> = vec![];
    let mut backups: Vec<(PathBuf, PathBuf)> = vec![];
    for tmp in staged {
        let target = tmp.target.clone();
        let backup = if target.exists() {
            let backup_path = sibling_with_infix(&target, BAK_INFIX)?;
            fs::copy(&target, &backup_path)
                .with_context(|| format!("Cannot back up {target:?}"))?;
            Some(backup_path)
        } else {
            None
        };

        match tmp.publish() {
            Ok(()) => {
                published.push(target.clone());
                if let Some(b) = backup {
                    backups.push((target, b));
                }
            }
            Err(e) => {
                if let Some(b) = backup {
                    let _ = fs::remove_file(&b);
                }
                revert(&backups);
                return Err(e);
            }
        }
    }

    for (_, backup) in backups {
        let _ = fs::remove_file(backup);
    }
    // Every published target gets its parent fsynced, same as write_file.
    for target in published {
        sync_parent_dir(&target)?;
    }
    Ok(())
}

/// `fs::create_dir_all` with the repository directory mode applied to every
/// directory this call actually creates.
pub fn create_dir_all(dir: &Path) -> EmptyRes {
    let mut missing = vec![];
    let mut cursor = dir;
    while !cursor.exists() {
        missing.push(cursor.to_path_buf());
        match cursor.parent() {
            Some(p) if !p.as_os_str().is_empty() => cursor = p,
            _ => break,
        }
    }
    fs::create_dir_all(dir).with_context(|| format!("Cannot create directory {dir:?}"))?;
    for created in missing {
        set_mode(&created, DIR_MODE)?;
    }
    Ok(())
}

fn revert(backups: &[(PathBuf, PathBuf)]) {
    for (target, backup) in backups.iter().rev() {
        if let Err(e) = fs::rename(backup, target) {
            log::error!("Failed to revert {}: {}", target.to_string_lossy(), e);
        }
    }
}

struct TempTarget {
    target: PathBuf,
    tmp: PathBuf,
}

impl TempTarget {
    fn stage(target: &Path, bytes: &[u8]) -> Result<TempTarget> {
        let tmp = sibling_with_infix(target, TMP_INFIX)?;
        let staged = TempTarget { target: target.to_owned(), tmp };
        staged.write(bytes)?;
        Ok(staged)
    }

    fn write(&self, bytes: &[u8]) -> EmptyRes {
        let mut file = File::create(&self.tmp)
            .with_context(|| format!("Cannot create temp file {:?}", self.tmp))?;
        set_mode(&self.tmp, FILE_MODE)?;
        file.write_all(bytes)
            .with_context(|| format!("Cannot write temp file {:?}", self.tmp))?;
        file.sync_all()
            .with_context(|| format!("Cannot fsync temp file {:?}", self.tmp))?;
        Ok(())
    }

    fn publish(self) -> EmptyRes {
        fs::rename(&self.tmp, &self.target)
            .with_context(|| format!("Cannot rename {:?} into place", self.tmp))
    }
}

// Whether staging failed, a rename failed, or the temp was already renamed
// into place, removing the temp path is the right cleanup (a published temp
// no longer exists under that name).
impl Drop for TempTarget {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.tmp);
    }
}

fn sibling_with_infix(target: &Path, infix: &str) -> Result<PathBuf> {
    let filename = path_file_name(target)?;
    let suffix = random_alphanumeric(8);
    Ok(target.with_file_name(format!("{filename}{infix}{suffix}")))
}

pub fn random_alphanumeric(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn sync_parent_dir(target: &Path) -> EmptyRes {
    if let Some(parent) = target.parent() {
        let dir = File::open(parent)
            .with_context(|| format!("Cannot open parent directory {parent:?}"))?;
        dir.sync_all()
            .with_context(|| format!("Cannot fsync parent directory {parent:?}"))?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> EmptyRes {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Cannot set permissions on {path:?}"))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> EmptyRes {
    Ok(())
}
