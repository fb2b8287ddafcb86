use std::fs;

use pretty_assertions::assert_eq;

use super::*;
use crate::prelude::*;

const RUN_STAMP: &str = "20260801-120000";

fn bad_record() -> RawElement {
    RawElement::new("sms")
        .with_attr("address", "555~666")
        .with_attr("date", "1425211200000")
        .with_attr("type", "1")
        .with_attr("contact_name", "Alice")
}

#[test]
fn sink_is_lazy_when_nothing_rejected() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let mut sink = RejectionSink::new(&repo, RUN_STAMP, false);
    sink.finish_batch(RejectKind::Sms)?;

    assert!(!repo.rejected_dir().exists());
    assert_eq!(sink.total_rejected(), 0);
    Ok(())
}

#[test]
fn batch_writes_reimportable_file() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let mut sink = RejectionSink::new(&repo, RUN_STAMP, false);
    sink.reject(bad_record(), "contact-name-mismatch: 2 addresses vs 1 names".to_owned());
    sink.finish_batch(RejectKind::Sms)?;

    assert_eq!(sink.written_files().len(), 1);
    let rel = &sink.written_files()[0];
    assert!(rel.starts_with("rejected/sms/sms-"));
    assert!(rel.ends_with(&format!("-{RUN_STAMP}.xml")));

    // The file parses in the source schema and preserves the record.
    let path = repo.root().join(rel);
    let records = crate::repo::read_partition(&path, Default::default(), "smses", |e| Ok(e.clone()))?;
    assert_eq!(records, vec![bad_record()]);
    Ok(())
}

#[test]
fn filename_embeds_content_hash_prefix() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let mut sink = RejectionSink::new(&repo, RUN_STAMP, false);
    sink.reject(bad_record(), "reason".to_owned());
    sink.finish_batch(RejectKind::Sms)?;

    let rel = &sink.written_files()[0];
    let filename = rel.rsplit('/').next().unwrap();
    // sms-<hash8>-<stamp>.xml
    let hash8 = filename.strip_prefix("sms-").unwrap().split('-').next().unwrap();
    assert_eq!(hash8.len(), 8);
    assert!(hash8.bytes().all(|b| b.is_ascii_hexdigit()));
    Ok(())
}

#[test]
fn batches_accumulate_per_kind_dirs() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let mut sink = RejectionSink::new(&repo, RUN_STAMP, false);

    sink.reject(RawElement::new("call").with_attr("number", "5"), "bad call".to_owned());
    sink.finish_batch(RejectKind::Calls)?;
    sink.reject(bad_record(), "bad sms".to_owned());
    sink.finish_batch(RejectKind::Sms)?;

    assert!(repo.rejected_dir().join("calls").is_dir());
    assert!(repo.rejected_dir().join("sms").is_dir());
    assert_eq!(sink.total_rejected(), 2);
    assert_eq!(sink.written_files().len(), 2);
    Ok(())
}

#[test]
fn discard_batch_forgets_current_records() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let mut sink = RejectionSink::new(&repo, RUN_STAMP, false);
    sink.reject(bad_record(), "reason".to_owned());

    assert_eq!(sink.discard_batch(), 1);
    assert_eq!(sink.total_rejected(), 0);
    sink.finish_batch(RejectKind::Sms)?;
    assert!(!repo.rejected_dir().exists());
    Ok(())
}

#[test]
fn dry_run_writes_nothing() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let mut sink = RejectionSink::new(&repo, RUN_STAMP, true);
    sink.reject(bad_record(), "reason".to_owned());
    sink.finish_batch(RejectKind::Sms)?;

    assert_eq!(sink.total_rejected(), 1);
    assert!(sink.written_files().is_empty());
    assert!(!repo.rejected_dir().exists());
    Ok(())
}

#[test]
fn rejection_files_stay_out_of_the_manifest() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let mut sink = RejectionSink::new(&repo, RUN_STAMP, false);
    sink.reject(bad_record(), "reason".to_owned());
    sink.finish_batch(RejectKind::Sms)?;

    let entries = crate::repo::manifest::build_manifest(&repo)?;
    assert!(entries.iter().all(|e| !e.file.starts_with("rejected/")));

    let leftovers = fs::read_dir(repo.rejected_dir().join("sms"))?.count();
    assert_eq!(leftovers, 1);
    Ok(())
}
