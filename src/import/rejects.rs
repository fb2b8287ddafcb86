use std::path::PathBuf;

use crate::prelude::*;
use crate::repo::{Repository, REJECTED_DIR};
use crate::utils::atomic;
use crate::xml::writer::render_rejects_file;
use crate::xml::{RawElement, CALLS_ROOT, SMSES_ROOT};

#[cfg(test)]
#[path = "rejects_tests.rs"]
mod tests;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RejectKind {
    Calls,
    Sms,
}

impl RejectKind {
    fn dir_name(&self) -> &'static str {
        match self {
            RejectKind::Calls => "calls",
            RejectKind::Sms => "sms",
        }
    }

    fn root_name(&self) -> &'static str {
        match self {
            RejectKind::Calls => CALLS_ROOT,
            RejectKind::Sms => SMSES_ROOT,
        }
    }
}

/// Collects invalid records in their original XML shape and mirrors them
/// under `rejected/`, one file per input-file batch, so a corrected file can
/// simply be re-imported.
///
/// The mirror directories are created lazily on the first batch of a kind;
/// a clean run leaves no `rejected/` tree behind.
pub struct RejectionSink<'a> {
    repo: &'a Repository,
    run_timestamp: String,
    dry_run: bool,
    batch: Vec<(RawElement, String)>,
    created_dirs: HashSet<RejectKind>,
    written_files: Vec<String>,
    total_rejected: u64,
}

impl<'a> RejectionSink<'a> {
    /// `run_stamp` is the shared `YYYYMMDD-HHMMSS` UTC stamp of this run.
    pub fn new(repo: &'a Repository, run_stamp: &str, dry_run: bool) -> Self {
        RejectionSink {
            repo,
            run_timestamp: run_stamp.to_owned(),
            dry_run,
            batch: vec![],
            created_dirs: HashSet::new(),
            written_files: vec![],
            total_rejected: 0,
        }
    }

    pub fn reject(&mut self, raw: RawElement, reason: String) {
        log::info!("Rejecting <{}> record: {reason}", raw.name);
        self.batch.push((raw, reason));
        self.total_rejected += 1;
    }

    pub fn total_rejected(&self) -> u64 {
        self.total_rejected
    }

    /// Throws away the current batch. Used when the whole input file turns
    /// out to be malformed: the file is dropped, its records do not count,
    /// and the sink stays unused for it.
    pub fn discard_batch(&mut self) -> u64 {
        let discarded = self.batch.len() as u64;
        self.batch.clear();
        self.total_rejected -= discarded;
        discarded
    }

    pub fn written_files(&self) -> &[String] {
        &self.written_files
    }

    /// Closes the current input file's batch, writing the rejection file if
    /// anything accumulated.
    pub fn finish_batch(&mut self, kind: RejectKind) -> EmptyRes {
        if self.batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        if self.dry_run {
            return Ok(());
        }

        let content = render_rejects_file(kind.root_name(), &batch)?;
        let hash8 = &hashing::hash_bytes(&content)[..8];
        let rel = format!("{REJECTED_DIR}/{}/{}-{hash8}-{}.xml",
                          kind.dir_name(), kind.dir_name(), self.run_timestamp);
        let target: PathBuf = self.repo.resolve(&rel)?;

        if self.created_dirs.insert(kind) {
            atomic::create_dir_all(target.parent().context("Rejection path has no parent")?)?;
        }
        atomic::write_file(&target, &content)?;
        log::warn!("Wrote {} rejected record(s) to {rel}", batch.len());
        self.written_files.push(rel);
        Ok(())
    }
}
