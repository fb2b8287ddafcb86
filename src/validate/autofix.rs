use crate::prelude::*;
use crate::repo::{self, contacts::ContactsFile, manifest, Marker, Repository};
use crate::utils::atomic;
use crate::validate::{FixAction, ValidationReport, Violation};
use crate::xml::{writer, CALLS_ROOT, SMSES_ROOT};

#[cfg(test)]
#[path = "autofix_tests.rs"]
mod tests;

#[derive(Clone, Debug, Default)]
pub struct AutofixOutcome {
    /// Human-readable descriptions of fixes applied (or, in dry-run, the
    /// fixes that would have been applied).
    pub fixed: Vec<String>,
    /// Violations with no whitelisted fix; they stay visible.
    pub remaining: Vec<Violation>,
    /// Failures while applying individual fixes.
    pub errors: Vec<String>,
}

/// Applies whitelisted, reconstructive fixes only. A checksum or size
/// mismatch on a content file is deliberately not fixable: it is the
/// evidence of real corruption, and regenerating it would destroy that
/// evidence. Every fix goes through the atomic writer and the whole pass is
/// idempotent.
pub fn autofix(repo: &Repository, report: &ValidationReport, dry_run: bool) -> Result<AutofixOutcome> {
    let mut outcome = AutofixOutcome::default();
    let mut count_rewrites = vec![];
    let mut contact_removals = vec![];
    let mut regenerate_manifest = false;
    let mut rewrite_checksum = false;

    for violation in &report.violations {
        match &violation.fix {
            None => outcome.remaining.push(violation.clone()),
            Some(action) => match action {
                FixAction::CreateDir(rel) => {
                    apply(&mut outcome, dry_run, format!("create directory '{rel}/'"), || {
                        atomic::create_dir_all(&repo.resolve(rel)?)
                    });
                }
                FixAction::WriteMarker => {
                    apply(&mut outcome, dry_run, "recreate marker file".to_owned(), || {
                        repo.write_marker(&Marker::current())
                    });
                }
                FixAction::WriteEmptyContacts => {
                    apply(&mut outcome, dry_run, "write empty contacts.yaml".to_owned(), || {
                        ContactsFile::default().write_to(repo)
                    });
                }
                FixAction::RewriteCount(rel) => count_rewrites.push(rel.clone()),
                FixAction::RegenerateManifest => regenerate_manifest = true,
                FixAction::RewriteManifestChecksum => rewrite_checksum = true,
                FixAction::RemoveUnprocessedContact(number) => contact_removals.push(number.clone()),
            },
        }
    }

    for rel in count_rewrites.iter().unique() {
        apply(&mut outcome, dry_run, format!("re-emit '{rel}' with corrected count"), || {
            rewrite_partition(repo, rel)
        });
        // The rewritten partition invalidates its manifest entry.
        regenerate_manifest = true;
    }

    if !contact_removals.is_empty() {
        apply(&mut outcome, dry_run,
              format!("remove {} unprocessed contact duplicate(s)", contact_removals.len()),
              || remove_unprocessed(repo, &contact_removals));
        // The rewritten contacts file invalidates its manifest entry.
        regenerate_manifest = true;
    }

    if regenerate_manifest {
        apply(&mut outcome, dry_run, "regenerate manifest from disk".to_owned(), || {
            let entries = manifest::build_manifest(repo)?;
            manifest::write_manifest(repo, &entries)
        });
    } else if rewrite_checksum {
        apply(&mut outcome, dry_run, "recompute files.yaml.sha256".to_owned(), || {
            let bytes = std::fs::read(repo.manifest_path()).context("Cannot read manifest")?;
            let checksum = format!("{}\n", hashing::hash_bytes(&bytes));
            atomic::write_file(&repo.manifest_checksum_path(), checksum.as_bytes())
        });
    }

    Ok(outcome)
}

fn apply(outcome: &mut AutofixOutcome,
         dry_run: bool,
         description: String,
         fix: impl FnOnce() -> EmptyRes) {
    if dry_run {
        log::info!("Would fix: {description}");
        outcome.fixed.push(description);
        return;
    }
    match fix() {
        Ok(()) => {
            log::info!("Fixed: {description}");
            outcome.fixed.push(description);
        }
        Err(e) => {
            log::error!("Failed to fix '{description}': {}", error_to_string(&e));
            outcome.errors.push(format!("{description}: {}", error_to_string(&e)));
        }
    }
}

/// Streaming rewrite of one year partition in canonical form, which renders
/// the count attribute from the actual record count.
fn rewrite_partition(repo: &Repository, rel: &str) -> EmptyRes {
    let path = repo.resolve(rel)?;
    let bytes = if rel.starts_with(repo::CALLS_DIR) {
        let records = repo::read_partition(&path, Default::default(), CALLS_ROOT, Call::from_xml)?;
        writer::render_calls_file(&records.iter().collect_vec())?
    } else {
        let records =
            repo::read_partition(&path, Default::default(), SMSES_ROOT, repo::message_from_xml)?;
        writer::render_messages_file(&records.iter().collect_vec())?
    };
    atomic::write_file(&path, &bytes)
}

fn remove_unprocessed(repo: &Repository, numbers: &[String]) -> EmptyRes {
    let mut file = ContactsFile::read_from(repo)?;
    let before = file.unprocessed.len();
    file.unprocessed.retain(|e| !numbers.contains(&e.phone_number));
    if file.unprocessed.len() != before {
        file.write_to(repo)?;
    }
    Ok(())
}
