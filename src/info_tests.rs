use pretty_assertions::assert_eq;

use super::*;
use crate::import::{self, ImportOptions};
use crate::prelude::*;
use crate::repo::Repository;

fn import_dump(dir: &std::path::Path, repo: &Repository, name: &str, content: &str) {
    let input = write_input(dir, name, content);
    import::import(repo, &ImportOptions { paths: vec![input], ..Default::default() }).unwrap();
}

#[test]
fn empty_repository_reports_zeroes() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let info = gather_info(&repo)?;

    assert_eq!(info.repository_structure_version, "1");
    assert!(info.counts.calls.is_empty());
    assert!(info.counts.sms.is_empty());
    assert_eq!(info.earliest, None);
    assert_eq!(info.latest, None);
    assert_eq!(info.attachments.count, 0);
    assert_eq!(info.contacts, ContactCounts { known: 0, unprocessed: 0 });
    Ok(())
}

#[test]
fn counts_by_kind_and_year() -> EmptyRes {
    let (dir, repo) = init_temp_repo();
    import_dump(dir.path(), &repo, "calls.xml", &calls_xml(&[
        call_xml("555", ts("2013-05-02 08:00:00"), 1, 30),
        call_xml("556", ts("2013-07-02 08:00:00"), 2, 30),
        call_xml("557", ts("2014-01-02 08:00:00"), 1, 30),
    ]));
    import_dump(dir.path(), &repo, "sms.xml", &smses_xml(&[
        sms_xml("555", ts("2014-03-01 10:00:00"), 1, "hello"),
    ]));

    let info = gather_info(&repo)?;
    assert_eq!(info.counts.calls[&2013], 2);
    assert_eq!(info.counts.calls[&2014], 1);
    assert_eq!(info.counts.sms[&2014], 1);
    assert_eq!(info.earliest.as_deref(), Some("2013-05-02T08:00:00Z"));
    assert_eq!(info.latest.as_deref(), Some("2014-03-01T10:00:00Z"));
    Ok(())
}

#[test]
fn attachment_families_and_sizes() -> EmptyRes {
    let (dir, repo) = init_temp_repo();
    let payload = jpeg_bytes(4096);
    import_dump(dir.path(), &repo, "sms.xml", &smses_xml(&[
        mms_xml("555", ts("2015-06-01 12:00:00"),
                &[part_xml(0, "image/jpeg", &b64(&payload))]),
    ]));
    // An orphan nobody references.
    crate::repo::attachments::store_blob(&repo, &png_bytes(2048))?;

    let info = gather_info(&repo)?;
    assert_eq!(info.attachments.count, 2);
    assert_eq!(info.attachments.total_size_bytes, 4096 + 2048);
    assert_eq!(info.attachments.by_family["image"],
               FamilyStats { count: 1, size_bytes: 4096 });
    assert_eq!(info.attachments.by_family["unreferenced"],
               FamilyStats { count: 1, size_bytes: 2048 });
    assert_eq!(info.attachments.orphaned, 1);
    Ok(())
}

#[test]
fn contact_and_rejection_counts() -> EmptyRes {
    let (dir, repo) = init_temp_repo();
    import_dump(dir.path(), &repo, "sms.xml", &smses_xml(&[
        sms_xml_named("5550001111", ts("2015-03-01 12:00:00"), "hi", "Alice"),
        sms_xml_named("555~666", ts("2015-03-02 12:00:00"), "group", "OnlyOneName"),
    ]));

    let info = gather_info(&repo)?;
    assert_eq!(info.contacts.unprocessed, 1);
    assert_eq!(info.rejections.sms, 1);
    assert_eq!(info.rejections.calls, 0);
    Ok(())
}

#[test]
fn info_serializes_to_json() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let info = gather_info(&repo)?;
    let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&info)?)?;
    assert_eq!(json["repository_structure_version"], "1");
    assert!(json["counts"]["calls"].is_object());
    assert!(json["attachments"]["by_family"].is_object());
    Ok(())
}
