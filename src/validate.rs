use std::collections::BTreeMap;
use std::fs;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;

use crate::prelude::*;
use crate::repo::{self, attachments, manifest, Repository};
use crate::repo::contacts::ContactsFile;
use crate::repo::manifest::ManifestEntry;
use crate::xml::{RecordReader, XmlLimits, CALLS_ROOT, SMSES_ROOT};

pub mod autofix;

#[cfg(test)]
#[path = "validate_tests.rs"]
mod tests;

#[derive(Serialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Serialize, Copy, Clone, Debug, PartialEq, Eq)]
pub enum ViolationKind {
    MissingFile,
    ExtraFile,
    ChecksumMismatch,
    SizeMismatch,
    CountMismatch,
    InvalidFormat,
    OrphanedAttachment,
    StructureViolation,
    MissingMarkerFile,
    UnsupportedVersion,
    FormatMismatch,
    UnknownFormat,
    DuplicateContact,
}

/// Concrete repair the autofix engine may apply for a violation. Not part of
/// the JSON wire shape; `suggested_fix` is its human rendering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FixAction {
    CreateDir(String),
    WriteMarker,
    WriteEmptyContacts,
    RewriteCount(String),
    RegenerateManifest,
    RewriteManifestChecksum,
    RemoveUnprocessedContact(String),
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    #[serde(rename = "type")]
    pub kind: ViolationKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    #[serde(skip)]
    pub fix: Option<FixAction>,
}

impl Violation {
    fn new(kind: ViolationKind, severity: Severity, message: String) -> Self {
        Violation {
            kind,
            severity,
            file: None,
            message,
            expected: None,
            actual: None,
            suggested_fix: None,
            fix: None,
        }
    }

    fn with_file(mut self, file: &str) -> Self {
        self.file = Some(file.to_owned());
        self
    }

    fn with_diff(mut self, expected: String, actual: String) -> Self {
        self.expected = Some(expected);
        self.actual = Some(actual);
        self
    }

    fn with_fix(mut self, description: &str, action: FixAction) -> Self {
        self.suggested_fix = Some(description.to_owned());
        self.fix = Some(action);
        self
    }
}

#[derive(Serialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Invalid,
}

#[derive(Serialize, Clone, Debug)]
pub struct ValidationReport {
    pub status: ValidationStatus,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    fn from_violations(violations: Vec<Violation>) -> Self {
        let status = if violations.is_empty() {
            ValidationStatus::Valid
        } else {
            ValidationStatus::Invalid
        };
        ValidationReport { status, violations }
    }

    pub fn has_errors(&self) -> bool {
        self.violations.iter().any(|v| v.severity == Severity::Error)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValidationScope {
    /// All phases.
    Full,
    /// Marker, structure and manifest phases only; the importer's pre-check.
    StructureAndManifest,
}

/// Runs the validation phases in order: marker, structure, manifest, then
/// (full scope only) per-file content and cross-file consistency. An
/// unsupported structure version short-circuits with that single violation.
pub fn validate(repo: &Repository, scope: ValidationScope) -> Result<ValidationReport> {
    measure(|| validate_inner(repo, scope), |res, t| match res {
        Ok(report) => log::info!("Validation finished in {t} ms: {} violation(s)",
                                 report.violations.len()),
        Err(_) => log::warn!("Validation failed after {t} ms"),
    })
}

fn validate_inner(repo: &Repository, scope: ValidationScope) -> Result<ValidationReport> {
    let mut violations = vec![];

    if let Err(fatal) = marker_phase(repo, &mut violations) {
        match pipeline_error(&fatal) {
            Some(PipelineError::UnsupportedVersion { found }) => {
                let violation = Violation::new(
                    ViolationKind::UnsupportedVersion,
                    Severity::Error,
                    format!("Repository structure version '{found}' is not supported"),
                ).with_file(repo::MARKER_FILENAME)
                    .with_diff(repo::STRUCTURE_VERSION.to_owned(), found.clone());
                return Ok(ValidationReport::from_violations(vec![violation]));
            }
            _ => return Err(fatal),
        }
    }

    structure_phase(repo, &mut violations)?;
    let disk_entries = manifest_phase(repo, &mut violations)?;

    if scope == ValidationScope::Full {
        let referenced = content_phase(repo, &disk_entries, &mut violations)?;
        consistency_phase(repo, &referenced, &mut violations)?;
    }

    Ok(ValidationReport::from_violations(violations))
}

//
// Phase 1: marker
//

fn marker_phase(repo: &Repository, violations: &mut Vec<Violation>) -> EmptyRes {
    let path = repo.marker_path();
    if !path.exists() {
        violations.push(Violation::new(
            ViolationKind::MissingMarkerFile,
            Severity::Error,
            format!("Marker file {} is missing", repo::MARKER_FILENAME),
        ).with_file(repo::MARKER_FILENAME)
            .with_fix("recreate the marker file", FixAction::WriteMarker));
        return Ok(());
    }

    let marker = match repo.read_marker() {
        Ok(marker) => marker,
        Err(e) => {
            violations.push(Violation::new(
                ViolationKind::InvalidFormat,
                Severity::Error,
                format!("Marker file does not parse: {}", error_to_string(&e)),
            ).with_file(repo::MARKER_FILENAME));
            return Ok(());
        }
    };

    if marker.repository_structure_version != repo::STRUCTURE_VERSION {
        // Propagated as the short-circuiting fatal.
        return Err(PipelineError::UnsupportedVersion {
            found: marker.repository_structure_version,
        }.into());
    }

    if parse_rfc3339(&marker.created_at).is_err() {
        violations.push(Violation::new(
            ViolationKind::InvalidFormat,
            Severity::Warning,
            format!("Marker created_at '{}' is not RFC 3339", marker.created_at),
        ).with_file(repo::MARKER_FILENAME));
    }
    Ok(())
}

//
// Phase 2: structure
//

fn structure_phase(repo: &Repository, violations: &mut Vec<Violation>) -> EmptyRes {
    for dir in repo::CONTENT_DIRS {
        if !repo.root().join(dir).is_dir() {
            violations.push(Violation::new(
                ViolationKind::StructureViolation,
                Severity::Error,
                format!("Required directory '{dir}/' is missing"),
            ).with_file(dir)
                .with_fix("create the directory", FixAction::CreateDir(dir.to_owned())));
        }
    }

    if !repo.contacts_path().exists() {
        violations.push(Violation::new(
            ViolationKind::MissingFile,
            Severity::Error,
            format!("{} is missing", repo::CONTACTS_FILENAME),
        ).with_file(repo::CONTACTS_FILENAME)
            .with_fix("write an empty contacts file", FixAction::WriteEmptyContacts));
    }

    // Stray files at the root are tolerated but reported.
    let known_root_files = [
        repo::MARKER_FILENAME, repo::LOCK_FILENAME, repo::MANIFEST_FILENAME,
        repo::MANIFEST_CHECKSUM_FILENAME, repo::CONTACTS_FILENAME, repo::SUMMARY_FILENAME,
    ];
    let known_root_dirs = [
        repo::CALLS_DIR, repo::SMS_DIR, repo::ATTACHMENTS_DIR, repo::REJECTED_DIR,
    ];
    for entry in fs::read_dir(repo.root()).context("Cannot read repository root")? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let known = if entry.file_type()?.is_dir() {
            known_root_dirs.contains(&name.as_str())
        } else {
            known_root_files.contains(&name.as_str()) || name.contains(atomic_tmp_infix())
        };
        if !known && !name.starts_with('.') {
            violations.push(Violation::new(
                ViolationKind::StructureViolation,
                Severity::Warning,
                format!("Unexpected entry '{name}' at repository root"),
            ).with_file(&name));
        }
    }
    Ok(())
}

fn atomic_tmp_infix() -> &'static str {
    crate::utils::atomic::TMP_INFIX
}

//
// Phase 3: manifest
//

/// Diffs `files.yaml` against the recomputed on-disk truth. Returns the
/// recomputed entries so later phases can reuse the hashes.
fn manifest_phase(repo: &Repository, violations: &mut Vec<Violation>) -> Result<Vec<ManifestEntry>> {
    let disk_entries = manifest::build_manifest(repo)?;

    if !repo.manifest_path().exists() {
        violations.push(Violation::new(
            ViolationKind::MissingFile,
            Severity::Error,
            format!("{} is missing", repo::MANIFEST_FILENAME),
        ).with_file(repo::MANIFEST_FILENAME)
            .with_fix("regenerate the manifest from disk", FixAction::RegenerateManifest));
        return Ok(disk_entries);
    }

    let declared = match manifest::read_manifest(repo) {
        Ok(declared) => declared,
        Err(e) => {
            violations.push(Violation::new(
                ViolationKind::InvalidFormat,
                Severity::Error,
                format!("Manifest does not parse: {}", error_to_string(&e)),
            ).with_file(repo::MANIFEST_FILENAME)
                .with_fix("regenerate the manifest from disk", FixAction::RegenerateManifest));
            return Ok(disk_entries);
        }
    };

    let declared_by_file: BTreeMap<&str, &ManifestEntry> =
        declared.iter().map(|e| (e.file.as_str(), e)).collect();
    let disk_by_file: BTreeMap<&str, &ManifestEntry> =
        disk_entries.iter().map(|e| (e.file.as_str(), e)).collect();

    for (file, declared_entry) in &declared_by_file {
        match disk_by_file.get(file) {
            None => violations.push(Violation::new(
                ViolationKind::MissingFile,
                Severity::Error,
                format!("'{file}' is listed in the manifest but missing on disk"),
            ).with_file(file)
                .with_fix("regenerate the manifest from disk", FixAction::RegenerateManifest)),
            Some(disk_entry) => {
                if disk_entry.size_bytes != declared_entry.size_bytes {
                    violations.push(Violation::new(
                        ViolationKind::SizeMismatch,
                        Severity::Error,
                        format!("'{file}' size differs from the manifest"),
                    ).with_file(file)
                        .with_diff(declared_entry.size_bytes.to_string(),
                                   disk_entry.size_bytes.to_string()));
                } else if disk_entry.sha256 != declared_entry.sha256 {
                    violations.push(Violation::new(
                        ViolationKind::ChecksumMismatch,
                        Severity::Error,
                        format!("'{file}' content differs from the manifest"),
                    ).with_file(file)
                        .with_diff(declared_entry.sha256.clone(), disk_entry.sha256.clone()));
                }
            }
        }
    }
    for file in disk_by_file.keys() {
        if !declared_by_file.contains_key(file) {
            violations.push(Violation::new(
                ViolationKind::ExtraFile,
                Severity::Error,
                format!("'{file}' exists on disk but is not in the manifest"),
            ).with_file(file)
                .with_fix("regenerate the manifest from disk", FixAction::RegenerateManifest));
        }
    }

    // The checksum sibling seals the manifest itself.
    let manifest_bytes = fs::read(repo.manifest_path()).context("Cannot re-read manifest")?;
    let computed_checksum = hashing::hash_bytes(&manifest_bytes);
    if !repo.manifest_checksum_path().exists() {
        violations.push(Violation::new(
            ViolationKind::MissingFile,
            Severity::Error,
            format!("{} is missing", repo::MANIFEST_CHECKSUM_FILENAME),
        ).with_file(repo::MANIFEST_CHECKSUM_FILENAME)
            .with_fix("recompute from the current manifest", FixAction::RewriteManifestChecksum));
    } else {
        let declared_checksum = manifest::read_manifest_checksum(repo)?;
        if declared_checksum != computed_checksum {
            violations.push(Violation::new(
                ViolationKind::ChecksumMismatch,
                Severity::Error,
                format!("{} does not match the manifest", repo::MANIFEST_CHECKSUM_FILENAME),
            ).with_file(repo::MANIFEST_CHECKSUM_FILENAME)
                .with_diff(computed_checksum, declared_checksum)
                .with_fix("recompute from the current manifest", FixAction::RewriteManifestChecksum));
        }
    }

    Ok(disk_entries)
}

//
// Phase 4: content
//

/// Who references a blob, and with what claimed content types.
#[derive(Clone, Debug, Default)]
pub struct BlobRefs {
    pub referrers: Vec<String>,
    pub cts: Vec<String>,
}

/// Per-file checks over year partitions and blob files. Returns every blob
/// hash referenced by an MMS part for the consistency phase.
fn content_phase(repo: &Repository,
                 disk_entries: &[ManifestEntry],
                 violations: &mut Vec<Violation>) -> Result<HashMap<String, BlobRefs>> {
    let mut referenced: HashMap<String, BlobRefs> = HashMap::new();

    for path in repo::list_partitions(&repo.calls_dir())? {
        validate_partition(repo, &path, CALLS_ROOT, violations, |elem, rel, violations| {
            let call = Call::from_xml(elem)?;
            check_record_year(rel, *call.date, violations);
            Ok(())
        })?;
    }
    for path in repo::list_partitions(&repo.sms_dir())? {
        validate_partition(repo, &path, SMSES_ROOT, violations, |elem, rel, violations| {
            let message = repo::message_from_xml(elem)?;
            check_record_year(rel, *message.date(), violations);
            if let Message::Mms(mms) = &message {
                for part in &mms.parts {
                    if let Some(hash) = part.blob_hash() {
                        let refs = referenced.entry(hash.to_owned()).or_default();
                        refs.referrers.push(rel.to_owned());
                        refs.cts.push(part.ct.clone());
                    } else if let Some(path) = part.path.as_deref() {
                        violations.push(Violation::new(
                            ViolationKind::InvalidFormat,
                            Severity::Error,
                            format!("MMS part path '{path}' is not a valid attachment reference"),
                        ).with_file(rel));
                    }
                }
            }
            Ok(())
        })?;
    }

    // Content-addressing means a blob must hash to its own basename; the
    // recomputed manifest already carries the hashes.
    for entry in disk_entries {
        let Some(rest) = entry.file.strip_prefix(&format!("{}/", repo::ATTACHMENTS_DIR)) else {
            continue;
        };
        let basename = rest.rsplit('/').next().unwrap_or(rest);
        if !hashing::is_hash_hex(basename)
            || rest != format!("{}/{basename}", &basename[..2]) {
            violations.push(Violation::new(
                ViolationKind::StructureViolation,
                Severity::Error,
                format!("'{}' is not a valid attachment blob location", entry.file),
            ).with_file(&entry.file));
        } else if basename != entry.sha256 {
            violations.push(Violation::new(
                ViolationKind::ChecksumMismatch,
                Severity::Error,
                format!("Blob '{}' does not hash to its own name", entry.file),
            ).with_file(&entry.file)
                .with_diff(basename.to_owned(), entry.sha256.clone()));
        }
    }

    Ok(referenced)
}

fn validate_partition(repo: &Repository,
                      path: &Path,
                      expected_root: &str,
                      violations: &mut Vec<Violation>,
                      mut check: impl FnMut(&crate::xml::RawElement, &str, &mut Vec<Violation>) -> EmptyRes)
                      -> EmptyRes {
    let rel = repo.relativize(path)?;
    let reader = match RecordReader::open(path, XmlLimits::default()) {
        Ok(reader) => reader,
        Err(e) => {
            violations.push(invalid_partition(&rel, &e));
            return Ok(());
        }
    };
    if reader.root_name() != expected_root {
        violations.push(Violation::new(
            ViolationKind::InvalidFormat,
            Severity::Error,
            format!("'{rel}' has root <{}>, expected <{expected_root}>", reader.root_name()),
        ).with_file(&rel));
        return Ok(());
    }
    let declared_count = reader.declared_count();

    let mut counted = 0u64;
    for elem in reader {
        let elem = match elem {
            Ok(elem) => elem,
            Err(e) => {
                violations.push(invalid_partition(&rel, &e));
                return Ok(());
            }
        };
        counted += 1;
        if let Err(e) = check(&elem, &rel, violations) {
            violations.push(Violation::new(
                ViolationKind::InvalidFormat,
                Severity::Error,
                format!("Invalid record in '{rel}': {}", error_to_string(&e)),
            ).with_file(&rel));
        }
    }

    match declared_count {
        Some(declared) if declared != counted => {
            violations.push(Violation::new(
                ViolationKind::CountMismatch,
                Severity::Error,
                format!("'{rel}' declares count {declared} but contains {counted} record(s)"),
            ).with_file(&rel)
                .with_diff(counted.to_string(), declared.to_string())
                .with_fix("re-emit the file with the corrected count",
                          FixAction::RewriteCount(rel.clone())));
        }
        None => {
            violations.push(Violation::new(
                ViolationKind::CountMismatch,
                Severity::Error,
                format!("'{rel}' has no numeric count attribute"),
            ).with_file(&rel)
                .with_diff(counted.to_string(), "absent".to_owned())
                .with_fix("re-emit the file with the corrected count",
                          FixAction::RewriteCount(rel.clone())));
        }
        _ => {}
    }
    Ok(())
}

fn invalid_partition(rel: &str, e: &anyhow::Error) -> Violation {
    Violation::new(
        ViolationKind::InvalidFormat,
        Severity::Error,
        format!("'{rel}' does not parse: {}", error_to_string(e)),
    ).with_file(rel)
}

fn check_record_year(rel: &str, date_ms: i64, violations: &mut Vec<Violation>) {
    let file_year = repo::year_of_partition(Path::new(rel));
    let Some(file_year) = file_year else {
        return;
    };
    match year_of_timestamp(date_ms) {
        Ok(year) if year == *file_year => {}
        Ok(year) => violations.push(Violation::new(
            ViolationKind::StructureViolation,
            Severity::Error,
            format!("Record dated {date_ms} belongs to {year}, not {file_year}"),
        ).with_file(rel)
            .with_diff(file_year.to_string(), year.to_string())),
        Err(_) => violations.push(Violation::new(
            ViolationKind::InvalidFormat,
            Severity::Error,
            format!("Record date {date_ms} is out of range"),
        ).with_file(rel)),
    }
}

//
// Magic-byte sniffing (small allow-list)
//

const SNIFF_HEAD_LEN: usize = 12;

fn expected_magic(ct: &str) -> Option<fn(&[u8]) -> bool> {
    match ct {
        "image/png" => Some(|h| h.starts_with(b"\x89PNG\r\n\x1a\n")),
        "image/jpeg" | "image/jpg" => Some(|h| h.starts_with(b"\xff\xd8\xff")),
        "image/gif" => Some(|h| h.starts_with(b"GIF87a") || h.starts_with(b"GIF89a")),
        "video/mp4" => Some(|h| h.len() >= 8 && &h[4..8] == b"ftyp"),
        "application/pdf" => Some(|h| h.starts_with(b"%PDF-")),
        _ => None,
    }
}

fn sniffed_name(head: &[u8]) -> Option<&'static str> {
    for ct in ["image/png", "image/jpeg", "image/gif", "video/mp4", "application/pdf"] {
        if expected_magic(ct).map(|check| check(head)).unwrap_or(false) {
            return Some(ct);
        }
    }
    None
}

fn read_head(path: &Path) -> Result<Vec<u8>> {
    let mut head = [0u8; SNIFF_HEAD_LEN];
    let mut file = File::open(path).with_context(|| format!("Cannot open {path:?}"))?;
    let mut read = 0;
    while read < SNIFF_HEAD_LEN {
        let n = file.read(&mut head[read..]).with_context(|| format!("Cannot read {path:?}"))?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(head[..read].to_vec())
}

/// Magic-byte corroboration of one referenced blob.
///
/// A claimed content type from the allow-list whose magic disagrees is a
/// `FormatMismatch`. Everything else is tolerated: a content type we cannot
/// sniff is not an integrity problem by itself, whatever the blob's magic.
fn sniff_blob(repo: &Repository,
              hash: &str,
              refs: &BlobRefs,
              violations: &mut Vec<Violation>) -> EmptyRes {
    let rel = attachments::blob_rel_path(hash);
    let head = read_head(&repo.resolve(&rel)?)?;
    for ct in refs.cts.iter().map(|ct| ct.to_ascii_lowercase()).unique() {
        if let Some(check) = expected_magic(&ct) {
            if !check(&head) {
                violations.push(Violation::new(
                    ViolationKind::FormatMismatch,
                    Severity::Warning,
                    format!("Blob '{rel}' claims {ct} but its magic bytes disagree"),
                ).with_file(&rel)
                    .with_diff(ct.clone(), sniffed_name(&head).unwrap_or("unknown").to_owned()));
            }
        }
    }
    Ok(())
}

//
// Phase 5: consistency
//

fn consistency_phase(repo: &Repository,
                     referenced: &HashMap<String, BlobRefs>,
                     violations: &mut Vec<Violation>) -> EmptyRes {
    let on_disk = attachments::list_blobs(repo)?;

    for (hash, refs) in referenced.iter().sorted_by(|a, b| a.0.cmp(b.0)) {
        if on_disk.contains(hash) {
            sniff_blob(repo, hash, refs, violations)?;
        } else {
            violations.push(Violation::new(
                ViolationKind::MissingFile,
                Severity::Error,
                format!("Attachment {} referenced by {} is missing",
                        attachments::blob_rel_path(hash),
                        refs.referrers.iter().unique().join(", ")),
            ).with_file(&attachments::blob_rel_path(hash)));
        }
    }
    for hash in &on_disk {
        if !referenced.contains_key(hash) {
            let mut violation = Violation::new(
                ViolationKind::OrphanedAttachment,
                Severity::Warning,
                format!("Attachment {} is referenced by no message",
                        attachments::blob_rel_path(hash)),
            ).with_file(&attachments::blob_rel_path(hash));
            violation.suggested_fix = Some("remove with --remove-orphan-attachments".to_owned());
            violations.push(violation);
        }
    }

    let contacts = ContactsFile::read_from(repo)?;
    let mut curated: HashMap<String, &str> = HashMap::new();
    for contact in &contacts.contacts {
        for number in &contact.numbers {
            let normalized = normalize_number(number);
            if let Some(previous) = curated.insert(normalized.clone(), &contact.name) {
                violations.push(Violation::new(
                    ViolationKind::DuplicateContact,
                    Severity::Warning,
                    format!("Number {normalized} appears under both '{previous}' and '{}'",
                            contact.name),
                ).with_file(repo::CONTACTS_FILENAME));
            }
        }
    }
    for entry in &contacts.unprocessed {
        if curated.contains_key(&entry.phone_number) {
            violations.push(Violation::new(
                ViolationKind::DuplicateContact,
                Severity::Warning,
                format!("Number {} is both curated and unprocessed", entry.phone_number),
            ).with_file(repo::CONTACTS_FILENAME)
                .with_fix("remove the unprocessed duplicate",
                          FixAction::RemoveUnprocessedContact(entry.phone_number.clone())));
        }
    }
    Ok(())
}

//
// Orphan sweep
//

/// Removes attachment blobs referenced by no MMS part, pruning emptied
/// shard directories. Returns the repo-relative paths removed.
pub fn remove_orphan_attachments(repo: &Repository, dry_run: bool) -> Result<Vec<String>> {
    let report = validate(repo, ValidationScope::Full)?;
    let orphans = report.violations.iter()
        .filter(|v| v.kind == ViolationKind::OrphanedAttachment)
        .filter_map(|v| v.file.clone())
        .collect_vec();
    if dry_run {
        for rel in &orphans {
            log::info!("Would remove orphan {rel}");
        }
        return Ok(orphans);
    }
    for rel in &orphans {
        let hash = rel.rsplit('/').next().context("Orphan path has no basename")?;
        attachments::remove_blob(repo, hash)?;
        log::info!("Removed orphan {rel}");
    }
    if !orphans.is_empty() {
        let entries = manifest::build_manifest(repo)?;
        manifest::write_manifest(repo, &entries)?;
    }
    Ok(orphans)
}
