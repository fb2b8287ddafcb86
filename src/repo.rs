use std::fs;
use std::fs::File;
use std::path::{Path, PathBuf};

use const_format::concatcp;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::prelude::*;
use crate::utils::atomic;
use crate::utils::safe_path;

pub mod attachments;
pub mod contacts;
pub mod manifest;
pub mod summary;

#[cfg(test)]
#[path = "repo_tests.rs"]
mod tests;

pub const MARKER_FILENAME: &str = ".mobilecombackup.yaml";
pub const LOCK_FILENAME: &str = ".mobilecombackup.lock";
pub const MANIFEST_FILENAME: &str = "files.yaml";
pub const MANIFEST_CHECKSUM_FILENAME: &str = concatcp!(MANIFEST_FILENAME, ".sha256");
pub const CONTACTS_FILENAME: &str = "contacts.yaml";
pub const SUMMARY_FILENAME: &str = "summary.yaml";

pub const CALLS_DIR: &str = "calls";
pub const SMS_DIR: &str = "sms";
pub const ATTACHMENTS_DIR: &str = "attachments";
pub const REJECTED_DIR: &str = "rejected";

pub const STRUCTURE_VERSION: &str = "1";

pub const CONTENT_DIRS: [&str; 3] = [CALLS_DIR, SMS_DIR, ATTACHMENTS_DIR];

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Marker {
    pub repository_structure_version: String,
    pub created_at: String,
    pub created_by: String,
}

impl Marker {
    pub fn current() -> Self {
        Marker {
            repository_structure_version: STRUCTURE_VERSION.to_owned(),
            created_at: now_rfc3339(),
            created_by: format!("mobilecombackup {}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Handle to a backup repository root. Mutation goes through the importer and
/// the autofix engine only; everything else reads.
#[derive(Clone, Debug)]
pub struct Repository {
    root: PathBuf,
}

impl Repository {
    /// Opens an existing directory as a repository. Marker validity is the
    /// validator's business; only the directory itself must exist.
    pub fn open(root: &Path) -> Result<Repository> {
        require!(root.is_dir(), "Repository root {} is not a directory", root.to_string_lossy());
        let root = root.canonicalize()
            .with_context(|| format!("Cannot canonicalize {root:?}"))?;
        Ok(Repository { root })
    }

    /// Creates an empty repository skeleton: marker, empty contacts, empty
    /// manifest pair and the three content directories. The target must not
    /// exist yet or be an empty directory. `summary.yaml` and `rejected/` are
    /// import-time artifacts and are never created here.
    pub fn init(target: &Path) -> Result<Repository> {
        if target.exists() {
            require!(target.is_dir(), "{} exists and is not a directory", target.to_string_lossy());
            let mut entries = fs::read_dir(target)
                .with_context(|| format!("Cannot read {target:?}"))?;
            require!(entries.next().is_none(), "{} is not empty", target.to_string_lossy());
        } else {
            atomic::create_dir_all(target)?;
        }
        let repo = Repository::open(target)?;
        let _lock = repo.lock()?;

        for dir in CONTENT_DIRS {
            atomic::create_dir_all(&repo.root.join(dir))?;
        }
        repo.write_marker(&Marker::current())?;
        contacts::ContactsFile::default().write_to(&repo)?;
        let entries = manifest::build_manifest(&repo)?;
        manifest::write_manifest(&repo, &entries)?;

        log::info!("Initialized empty repository at {}", repo.root.to_string_lossy());
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a repo-relative path, confining it to the repository root.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        safe_path::join_confined(&self.root, rel)
    }

    /// Repo-relative form of an absolute path inside the repository, with
    /// forward slashes irrespective of OS.
    pub fn relativize(&self, abs: &Path) -> Result<String> {
        let rel = abs.strip_prefix(&self.root)
            .with_context(|| format!("{abs:?} is not under the repository root"))?;
        let components: Vec<&str> = rel.iter()
            .map(|c| c.to_str().context("Non-UTF-8 path component"))
            .collect::<Result<_>>()?;
        Ok(components.join("/"))
    }

    //
    // Well-known paths
    //

    pub fn marker_path(&self) -> PathBuf {
        self.root.join(MARKER_FILENAME)
    }

    pub fn contacts_path(&self) -> PathBuf {
        self.root.join(CONTACTS_FILENAME)
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join(SUMMARY_FILENAME)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILENAME)
    }

    pub fn manifest_checksum_path(&self) -> PathBuf {
        self.root.join(MANIFEST_CHECKSUM_FILENAME)
    }

    pub fn calls_dir(&self) -> PathBuf {
        self.root.join(CALLS_DIR)
    }

    pub fn sms_dir(&self) -> PathBuf {
        self.root.join(SMS_DIR)
    }

    pub fn attachments_dir(&self) -> PathBuf {
        self.root.join(ATTACHMENTS_DIR)
    }

    pub fn rejected_dir(&self) -> PathBuf {
        self.root.join(REJECTED_DIR)
    }

    pub fn calls_file(&self, year: Year) -> PathBuf {
        self.calls_dir().join(format!("calls-{year}.xml"))
    }

    pub fn sms_file(&self, year: Year) -> PathBuf {
        self.sms_dir().join(format!("sms-{year}.xml"))
    }

    //
    // Marker
    //

    pub fn read_marker(&self) -> Result<Marker> {
        let path = self.marker_path();
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read marker file {path:?}"))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Marker file {path:?} is not valid YAML"))
    }

    pub fn write_marker(&self, marker: &Marker) -> EmptyRes {
        let bytes = to_canonical_yaml(marker)?;
        atomic::write_file(&self.marker_path(), &bytes)
    }

    /// Checks the marker parses and declares a supported structure version.
    pub fn check_marker(&self) -> Result<Marker> {
        let marker = self.read_marker()?;
        if marker.repository_structure_version != STRUCTURE_VERSION {
            return Err(PipelineError::UnsupportedVersion {
                found: marker.repository_structure_version.clone(),
            }.into());
        }
        Ok(marker)
    }

    //
    // Locking
    //

    /// Takes the advisory exclusive lock every mutating command holds for its
    /// whole run. Readers deliberately skip this and accept stale reads.
    pub fn lock(&self) -> Result<RepoLock> {
        let path = self.root.join(LOCK_FILENAME);
        let file = File::create(&path)
            .with_context(|| format!("Cannot create lock file {path:?}"))?;
        file.try_lock_exclusive()
            .with_context(|| format!("Repository is locked by another process ({})",
                                     path.to_string_lossy()))?;
        Ok(RepoLock { file, path })
    }
}

pub struct RepoLock {
    file: File,
    path: PathBuf,
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            log::warn!("Failed to release repository lock: {e}");
        }
        let _ = fs::remove_file(&self.path);
    }
}

/// Canonical YAML rendering: serde struct order, LF, UTF-8, trailing newline.
pub fn to_canonical_yaml<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let s = serde_yaml::to_string(value).context("YAML serialization failed")?;
    Ok(s.into_bytes())
}

//
// Partition files
//

lazy_static::lazy_static! {
    static ref YEAR_FILENAME_REGEX: regex::Regex =
        regex::Regex::new(r"^(?:calls|sms)-(\d{4})\.xml$").unwrap();
}

pub fn year_of_partition(path: &Path) -> Option<Year> {
    let filename = path.file_name()?.to_str()?;
    YEAR_FILENAME_REGEX.captures(filename)
        .and_then(|c| c.get(1).unwrap().as_str().parse().ok())
        .map(Year)
}

/// Existing year files of one kind, sorted by name.
pub fn list_partitions(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = vec![];
    if !dir.is_dir() {
        return Ok(paths);
    }
    for entry in fs::read_dir(dir).with_context(|| format!("Cannot read {dir:?}"))? {
        let entry = entry?;
        if entry.file_type()?.is_file() && year_of_partition(&entry.path()).is_some() {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

pub fn expect_root<R: std::io::BufRead>(reader: &crate::xml::RecordReader<R>,
                                        expected: &str,
                                        path: &Path) -> EmptyRes {
    require!(reader.root_name() == expected,
             "{} has root <{}>, expected <{expected}>",
             path.to_string_lossy(), reader.root_name());
    Ok(())
}

/// Fully reads one existing partition file into typed records.
pub fn read_partition<T>(path: &Path,
                         limits: crate::xml::XmlLimits,
                         expected_root: &str,
                         parse: impl Fn(&crate::xml::RawElement) -> Result<T>) -> Result<Vec<T>> {
    let reader = crate::xml::RecordReader::open(path, limits)?;
    expect_root(&reader, expected_root, path)?;
    let mut records = vec![];
    for elem in reader {
        let elem = elem?;
        records.push(parse(&elem)
            .with_context(|| format!("Invalid record in {}", path.to_string_lossy()))?);
    }
    Ok(records)
}

pub fn message_from_xml(elem: &crate::xml::RawElement) -> Result<Message> {
    match elem.name.as_str() {
        "sms" => Ok(Message::Sms(Sms::from_xml(elem)?)),
        "mms" => Ok(Message::Mms(Mms::from_xml(elem)?)),
        etc => err!("Unexpected <{etc}> in sms partition"),
    }
}

pub fn message_fingerprint(message: &Message) -> Fingerprint {
    match message {
        Message::Sms(sms) => sms.fingerprint(),
        Message::Mms(mms) => mms.fingerprint(),
    }
}
