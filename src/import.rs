use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::import::coalescer::{AddOutcome, Coalescer, DatedRecord, YearCounters};
use crate::import::extractor::ExtractionStats;
use crate::import::rejects::{RejectKind, RejectionSink};
use crate::prelude::*;
use crate::repo::{expect_root, list_partitions, manifest, message_fingerprint, message_from_xml,
                  read_partition, Repository};
use crate::repo::contacts::ContactsStore;
use crate::repo::summary::Summary;
use crate::utils::atomic;
use crate::validate;
use crate::validate::{Severity, ValidationScope};
use crate::xml::{writer, RawElement, RecordReader, XmlLimits, CALLS_ROOT, SMSES_ROOT};

pub mod coalescer;
pub mod extractor;
pub mod rejects;

#[cfg(test)]
#[path = "import_tests.rs"]
mod tests;

lazy_static! {
    static ref CALLS_FILENAME_REGEX: Regex = Regex::new(r"^calls.*\.xml$").unwrap();
    static ref SMS_FILENAME_REGEX: Regex = Regex::new(r"^sms.*\.xml$").unwrap();
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordFilter {
    Calls,
    Sms,
}

#[derive(Clone, Debug, Default)]
pub struct ImportOptions {
    /// Files or directories to scan; empty means the current directory.
    pub paths: Vec<PathBuf>,
    pub dry_run: bool,
    pub filter: Option<RecordFilter>,
    /// Checked between records and between files.
    pub cancel: Option<Arc<AtomicBool>>,
    pub limits: XmlLimits,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct KindSummary {
    pub initial: u64,
    pub added: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub years: BTreeMap<i32, YearCounters>,
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct ImportSummary {
    pub files_processed: u64,
    pub files_failed: u64,
    pub calls: KindSummary,
    pub sms: KindSummary,
    pub attachments_extracted: u64,
    pub rejection_files: Vec<String>,
    pub counter_warnings: Vec<String>,
    pub dry_run: bool,
}

impl ImportSummary {
    pub fn total_rejected(&self) -> u64 {
        self.calls.rejected + self.sms.rejected
    }
}

/// One import run: pre-validate, load existing partitions, scan inputs,
/// dedup + extract, then publish partitions, contacts, manifest and summary
/// in that order. Nothing in the repository is mutated before the write
/// phase except content-addressed attachment blobs.
pub fn import(repo: &Repository, options: &ImportOptions) -> Result<ImportSummary> {
    let _lock = if options.dry_run { None } else { Some(repo.lock()?) };

    measure(|| import_inner(repo, options), |res, t| match res {
        Ok(_) => log::info!("Import finished in {t} ms"),
        Err(_) => log::warn!("Import failed after {t} ms"),
    })
}

fn import_inner(repo: &Repository, options: &ImportOptions) -> Result<ImportSummary> {
    pre_validate(repo)?;

    let mut run = ImportRun::new(repo, options)?;
    run.load_existing()?;

    let inputs = scan_inputs(repo, options)?;
    log::info!("Found {} input file(s)", inputs.len());
    for input in &inputs {
        run.check_cancelled()?;
        run.process_file(input)?;
    }

    run.finish()
}

/// Structure-and-manifest pre-check; any error-severity violation aborts
/// before anything is read from the inputs.
fn pre_validate(repo: &Repository) -> EmptyRes {
    let report = validate::validate(repo, ValidationScope::StructureAndManifest)?;
    let errors = report.violations.iter()
        .filter(|v| v.severity == Severity::Error)
        .collect_vec();
    if !errors.is_empty() {
        for v in &errors {
            log::error!("Pre-validation: {}", v.message);
        }
        bail!("Repository failed pre-validation with {} error(s), not importing", errors.len());
    }
    Ok(())
}

//
// Input scanning
//

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct InputFile {
    path: PathBuf,
    kind: RejectKind,
}

fn scan_inputs(repo: &Repository, options: &ImportOptions) -> Result<Vec<InputFile>> {
    let paths = if options.paths.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        options.paths.clone()
    };

    let mut inputs = vec![];
    for path in &paths {
        require!(path.exists(), "Input path {} does not exist", path.to_string_lossy());
        for entry in walkdir::WalkDir::new(path)
            .follow_links(true)
            .into_iter()
            .filter_entry(|e| !is_hidden_dir(e)) {
            let entry = entry.with_context(|| format!("Cannot scan {path:?}"))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(kind) = input_kind(entry.path()) else {
                continue;
            };
            if matches!((options.filter, kind),
                        (Some(RecordFilter::Calls), RejectKind::Sms) |
                        (Some(RecordFilter::Sms), RejectKind::Calls)) {
                continue;
            }
            // Files already inside the repository are its own partitions.
            let canonical = entry.path().canonicalize()
                .with_context(|| format!("Cannot canonicalize {:?}", entry.path()))?;
            if canonical.starts_with(repo.root()) {
                continue;
            }
            inputs.push(InputFile { path: canonical, kind });
        }
    }
    inputs.sort();
    inputs.dedup();
    Ok(inputs)
}

fn is_hidden_dir(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry.depth() > 0
        && entry.file_name().to_str().map(|n| n.starts_with('.')).unwrap_or(false)
}

fn input_kind(path: &Path) -> Option<RejectKind> {
    let filename = path.file_name()?.to_str()?;
    if CALLS_FILENAME_REGEX.is_match(filename) {
        Some(RejectKind::Calls)
    } else if SMS_FILENAME_REGEX.is_match(filename) {
        Some(RejectKind::Sms)
    } else {
        None
    }
}

//
// The run itself
//

struct ImportRun<'a> {
    repo: &'a Repository,
    options: &'a ImportOptions,
    run_rfc3339: String,
    calls: Coalescer<Call>,
    messages: Coalescer<Message>,
    contacts: ContactsStore,
    rejects: RejectionSink<'a>,
    extraction: ExtractionStats,
    summary: ImportSummary,
}

impl<'a> ImportRun<'a> {
    fn new(repo: &'a Repository, options: &'a ImportOptions) -> Result<Self> {
        let now = Utc::now();
        let run_stamp = now.format("%Y%m%d-%H%M%S").to_string();
        Ok(ImportRun {
            repo,
            options,
            run_rfc3339: now.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            calls: Coalescer::new(),
            messages: Coalescer::new(),
            contacts: ContactsStore::load(repo)?,
            rejects: RejectionSink::new(repo, &run_stamp, options.dry_run),
            extraction: ExtractionStats::default(),
            summary: ImportSummary { dry_run: options.dry_run, ..Default::default() },
        })
    }

    fn check_cancelled(&self) -> EmptyRes {
        if let Some(cancel) = &self.options.cancel {
            require!(!cancel.load(Ordering::Relaxed), "Import cancelled");
        }
        Ok(())
    }

    /// Seeds both coalescers from the repository's own partitions.
    fn load_existing(&mut self) -> EmptyRes {
        for path in list_partitions(&self.repo.calls_dir())? {
            let records = read_partition(&path, self.options.limits, CALLS_ROOT, |elem| {
                require!(elem.name == "call", "Unexpected <{}> in calls partition", elem.name);
                Call::from_xml(elem)
            })?;
            for (year, keyed) in partition_by_year(records, |c: &Call| c.fingerprint())? {
                self.calls.load_existing(year, keyed);
            }
        }
        for path in list_partitions(&self.repo.sms_dir())? {
            let records = read_partition(&path, self.options.limits, SMSES_ROOT, message_from_xml)?;
            for (year, keyed) in partition_by_year(records, message_fingerprint)? {
                self.messages.load_existing(year, keyed);
            }
        }
        log::info!("Loaded {} existing call(s) and {} existing message(s)",
                   self.calls.total_records(), self.messages.total_records());
        Ok(())
    }

    fn process_file(&mut self, input: &InputFile) -> EmptyRes {
        log::info!("Processing {}", input.path.to_string_lossy());
        let result = match input.kind {
            RejectKind::Calls => self.process_calls_file(&input.path),
            RejectKind::Sms => self.process_sms_file(&input.path),
        };
        match result {
            Ok(()) => {
                self.rejects.finish_batch(input.kind)?;
                self.summary.files_processed += 1;
                Ok(())
            }
            Err(e) => match pipeline_error(&e) {
                // An unparseable file is dropped wholesale; none of its
                // records count, and the other files continue.
                Some(PipelineError::MalformedXml { .. }) => {
                    log::error!("{}", error_to_string(&e));
                    let discarded = self.rejects.discard_batch();
                    match input.kind {
                        RejectKind::Calls => self.summary.calls.rejected -= discarded,
                        RejectKind::Sms => self.summary.sms.rejected -= discarded,
                    }
                    self.summary.files_failed += 1;
                    Ok(())
                }
                _ => Err(e),
            },
        }
    }

    fn process_calls_file(&mut self, path: &Path) -> EmptyRes {
        let reader = RecordReader::open(path, self.options.limits)?;
        expect_root(&reader, CALLS_ROOT, path)?;

        let mut staged: Vec<(Year, Fingerprint, Call)> = vec![];
        let mut staged_index = HashSet::new();
        let mut duplicates = 0u64;
        for elem in reader {
            self.check_cancelled()?;
            let elem = elem?;
            let call = match self.to_valid_call(&elem) {
                Ok(call) => call,
                Err(reason) => {
                    self.rejects.reject(elem, reason);
                    self.summary.calls.rejected += 1;
                    continue;
                }
            };
            let fingerprint = call.fingerprint();
            if self.calls.contains(&fingerprint) || !staged_index.insert(fingerprint) {
                duplicates += 1;
                continue;
            }
            staged.push((call.date.year_utc()?, fingerprint, call));
        }

        // Commit only once the whole file scanned cleanly.
        self.summary.calls.duplicates += duplicates;
        for (year, fingerprint, call) in staged {
            let outcome = self.calls.add(year, fingerprint, call);
            debug_assert_eq!(outcome, AddOutcome::Added);
            self.summary.calls.added += 1;
        }
        Ok(())
    }

    fn process_sms_file(&mut self, path: &Path) -> EmptyRes {
        let reader = RecordReader::open(path, self.options.limits)?;
        expect_root(&reader, SMSES_ROOT, path)?;

        let mut staged: Vec<(Year, Fingerprint, Message)> = vec![];
        let mut staged_index = HashSet::new();
        let mut duplicates = 0u64;
        for elem in reader {
            self.check_cancelled()?;
            let elem = elem?;
            let message = match self.to_valid_message(&elem) {
                Ok(message) => message,
                Err(reason) => {
                    self.rejects.reject(elem, reason);
                    self.summary.sms.rejected += 1;
                    continue;
                }
            };
            let fingerprint = message_fingerprint(&message);
            if self.messages.contains(&fingerprint) || !staged_index.insert(fingerprint) {
                duplicates += 1;
                continue;
            }
            staged.push((message.date().year_utc()?, fingerprint, message));
        }

        self.summary.sms.duplicates += duplicates;
        for (year, fingerprint, message) in staged {
            let outcome = self.messages.add(year, fingerprint, message);
            debug_assert_eq!(outcome, AddOutcome::Added);
            self.summary.sms.added += 1;
        }
        Ok(())
    }

    /// Full record validation pipeline; `Err` carries the rejection reason.
    fn to_valid_call(&mut self, elem: &RawElement) -> std::result::Result<Call, String> {
        if elem.name != "call" {
            return Err(format!("unexpected <{}> in calls file", elem.name));
        }
        let call = Call::from_xml(elem).map_err(|e| rejection_reason(&e))?;
        if let Some(contact_name) = call.contact_name.as_deref() {
            self.contacts.harvest(&call.number, contact_name)
                .map_err(|e| rejection_reason(&e))?;
        }
        Ok(call)
    }

    fn to_valid_message(&mut self, elem: &RawElement) -> std::result::Result<Message, String> {
        let mut message = match elem.name.as_str() {
            "sms" => Message::Sms(Sms::from_xml(elem).map_err(|e| rejection_reason(&e))?),
            "mms" => Message::Mms(Mms::from_xml(elem).map_err(|e| rejection_reason(&e))?),
            etc => return Err(format!("unexpected <{etc}> in sms file")),
        };

        {
            let (address, contact_name) = message.address_and_contact_name();
            if let Some(contact_name) = contact_name {
                let address = address.to_owned();
                self.contacts.harvest(&address, contact_name)
                    .map_err(|e| rejection_reason(&e))?;
            }
        }

        if let Message::Mms(mms) = &mut message {
            let mut stats = ExtractionStats::default();
            extractor::extract_mms_parts(self.repo, mms, &self.run_rfc3339,
                                         self.options.dry_run, &mut stats)
                .map_err(|e| rejection_reason(&e))?;
            self.extraction.parts_extracted += stats.parts_extracted;
            self.extraction.blobs_written += stats.blobs_written;
            self.extraction.bytes_decoded += stats.bytes_decoded;
        }
        Ok(message)
    }

    fn finish(mut self) -> Result<ImportSummary> {
        self.summary.attachments_extracted = self.extraction.parts_extracted;
        self.summary.rejection_files = self.rejects.written_files().to_vec();
        fill_kind_summary(&mut self.summary.calls, &self.calls);
        fill_kind_summary(&mut self.summary.sms, &self.messages);

        if self.options.dry_run {
            log::info!("Dry run, repository left untouched");
            return Ok(self.summary);
        }

        self.write_partitions()?;
        self.contacts.persist(self.repo)?;

        // The manifest must list the summary, but the summary may only land
        // once the manifest is durable. Hash the pending summary bytes into
        // the manifest, publish it, then write the summary itself.
        let summary_bytes = self.render_summary_file()?;
        let mut entries = manifest::build_manifest(self.repo)?;
        entries.retain(|e| e.file != crate::repo::SUMMARY_FILENAME);
        entries.push(manifest::ManifestEntry {
            file: crate::repo::SUMMARY_FILENAME.to_owned(),
            sha256: hashing::hash_bytes(&summary_bytes),
            size_bytes: summary_bytes.len() as u64,
        });
        entries.sort_by(|a, b| a.file.cmp(&b.file));
        manifest::write_manifest(self.repo, &entries)?;
        atomic::write_file(&self.repo.summary_path(), &summary_bytes)?;

        self.summary.counter_warnings.extend(self.calls.verify_counters());
        self.summary.counter_warnings.extend(self.messages.verify_counters());
        for warning in &self.summary.counter_warnings {
            log::warn!("Counter mismatch: {warning}");
        }

        self.summary.rejection_files = self.rejects.written_files().to_vec();
        Ok(self.summary)
    }

    /// Re-emits every affected year's full partition file.
    fn write_partitions(&self) -> EmptyRes {
        for year in self.calls.affected_years() {
            let records = self.calls.records_for_year(year);
            let bytes = writer::render_calls_file(&records)?;
            atomic::write_file(&self.repo.calls_file(year), &bytes)?;
            log::info!("Wrote {} call(s) for {year}", records.len());
        }
        for year in self.messages.affected_years() {
            let records = self.messages.records_for_year(year);
            let bytes = writer::render_messages_file(&records)?;
            atomic::write_file(&self.repo.sms_file(year), &bytes)?;
            log::info!("Wrote {} message(s) for {year}", records.len());
        }
        Ok(())
    }

    fn render_summary_file(&self) -> Result<Vec<u8>> {
        let years: std::collections::BTreeSet<i32> =
            self.calls.years().into_iter().chain(self.messages.years()).map(|y| *y).collect();
        crate::repo::to_canonical_yaml(&Summary {
            last_updated: now_rfc3339(),
            total_calls: self.calls.total_records(),
            total_sms: self.messages.total_records(),
            years_covered: years.into_iter().collect(),
        })
    }
}

fn fill_kind_summary<T>(summary: &mut KindSummary, coalescer: &Coalescer<T>) {
    summary.initial = coalescer.counters().values().map(|c| c.initial).sum();
    summary.years = coalescer.counters().iter().map(|(y, c)| (**y, *c)).collect();
}

fn rejection_reason(e: &anyhow::Error) -> String {
    pipeline_error(e)
        .and_then(|pe| pe.rejection_reason())
        .unwrap_or_else(|| error_to_string(e))
}

fn partition_by_year<T: DatedRecord>(records: Vec<T>,
                                     fingerprint: impl Fn(&T) -> Fingerprint)
                                     -> Result<BTreeMap<Year, Vec<(Fingerprint, T)>>> {
    let mut by_year: BTreeMap<Year, Vec<(Fingerprint, T)>> = BTreeMap::new();
    for record in records {
        let year = record.date().year_utc()?;
        by_year.entry(year).or_default().push((fingerprint(&record), record));
    }
    Ok(by_year)
}
