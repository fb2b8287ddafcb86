use std::fs;

use pretty_assertions::assert_eq;

use super::*;
use crate::prelude::*;

fn store_with_known(name: &str, numbers: &[&str]) -> ContactsStore {
    ContactsStore::from_file(ContactsFile {
        contacts: vec![Contact {
            name: name.to_owned(),
            numbers: numbers.iter().map(|n| (*n).to_owned()).collect(),
        }],
        unprocessed: vec![],
    })
}

//
// Harvesting
//

#[test]
fn harvest_adds_new_pair_to_unprocessed() -> EmptyRes {
    let mut store = ContactsStore::from_file(ContactsFile::default());
    store.harvest("+15551234567", "Alice")?;

    let file = store.to_file();
    assert_eq!(file.unprocessed, vec![UnprocessedEntry {
        phone_number: "5551234567".to_owned(),
        contact_names: vec!["Alice".to_owned()],
    }]);
    assert!(store.is_dirty());
    Ok(())
}

#[test]
fn harvest_merges_names_in_first_seen_order() -> EmptyRes {
    let mut store = ContactsStore::from_file(ContactsFile::default());
    store.harvest("555", "Alice")?;
    store.harvest("555", "Alicia")?;
    store.harvest("555", "Alice")?;

    let file = store.to_file();
    assert_eq!(file.unprocessed[0].contact_names,
               vec!["Alice".to_owned(), "Alicia".to_owned()]);
    Ok(())
}

#[test]
fn harvest_ignores_curated_numbers() -> EmptyRes {
    let mut store = store_with_known("Alice", &["(555) 123-4567"]);
    store.harvest("+15551234567", "Alice Mobile")?;
    assert!(store.to_file().unprocessed.is_empty());
    assert!(!store.is_dirty());
    Ok(())
}

#[test]
fn harvest_filters_placeholder_names() -> EmptyRes {
    let mut store = ContactsStore::from_file(ContactsFile::default());
    store.harvest("555", "(Unknown)")?;
    store.harvest("556", "null")?;
    store.harvest("557", "")?;
    assert!(store.to_file().unprocessed.is_empty());
    Ok(())
}

#[test]
fn harvest_pairs_group_addresses_with_names() -> EmptyRes {
    let mut store = ContactsStore::from_file(ContactsFile::default());
    store.harvest("555~666", "Alice, Bob")?;

    let file = store.to_file();
    assert_eq!(file.unprocessed.len(), 2);
    assert_eq!(file.unprocessed[0].phone_number, "555");
    assert_eq!(file.unprocessed[0].contact_names, vec!["Alice".to_owned()]);
    assert_eq!(file.unprocessed[1].contact_names, vec!["Bob".to_owned()]);
    Ok(())
}

#[test]
fn harvest_rejects_count_mismatch_without_mutating() {
    let mut store = ContactsStore::from_file(ContactsFile::default());
    let err = store.harvest("555~666", "Alice").unwrap_err();
    assert!(matches!(pipeline_error(&err), Some(PipelineError::RecordInvalid { .. })));
    // Never pair by position when counts differ.
    assert!(store.to_file().unprocessed.is_empty());
    assert!(!store.is_dirty());
}

//
// Curated/unprocessed invariant
//

#[test]
fn drop_curated_duplicates_removes_overlap() {
    let mut store = ContactsStore::from_file(ContactsFile {
        contacts: vec![Contact { name: "Alice".to_owned(), numbers: vec!["5551234567".to_owned()] }],
        unprocessed: vec![
            UnprocessedEntry {
                phone_number: "5551234567".to_owned(),
                contact_names: vec!["Alice".to_owned()],
            },
            UnprocessedEntry {
                phone_number: "666".to_owned(),
                contact_names: vec!["Bob".to_owned()],
            },
        ],
    });
    let dropped = store.drop_curated_duplicates();
    assert_eq!(dropped, vec!["5551234567".to_owned()]);
    assert_eq!(store.to_file().unprocessed.len(), 1);
}

//
// Persistence
//

#[test]
fn unprocessed_serializes_sorted_by_number() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let mut store = ContactsStore::from_file(ContactsFile::default());
    store.harvest("999", "Zed")?;
    store.harvest("111", "Ann")?;
    store.harvest("555", "Mid")?;
    store.persist(&repo)?;

    let reloaded = ContactsFile::read_from(&repo)?;
    let numbers = reloaded.unprocessed.iter().map(|e| e.phone_number.as_str()).collect_vec();
    assert_eq!(numbers, vec!["111", "555", "999"]);
    Ok(())
}

#[test]
fn missing_file_reads_as_empty() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    fs::remove_file(repo.contacts_path())?;
    assert_eq!(ContactsFile::read_from(&repo)?, ContactsFile::default());
    Ok(())
}

#[test]
fn persist_is_deterministic() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let mut store = ContactsStore::from_file(ContactsFile::default());
    store.harvest("555", "Alice")?;
    store.persist(&repo)?;
    let first = fs::read(repo.contacts_path())?;
    store.persist(&repo)?;
    assert_eq!(fs::read(repo.contacts_path())?, first);
    Ok(())
}

//
// Reprocess
//

#[test]
fn reprocess_contacts_harvests_from_partitions() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let date = ts("2014-03-01 10:00:00");
    let content = smses_xml(&[sms_xml_named("5550001111", date, "hi", "Carol")]);
    create_named_file(&repo.sms_file(Year(2014)), content.as_bytes());

    let summary = reprocess_contacts(&repo, false)?;
    assert_eq!(summary.records_scanned, 1);
    assert_eq!(summary.unprocessed_before, 0);
    assert_eq!(summary.unprocessed_after, 1);

    let reloaded = ContactsFile::read_from(&repo)?;
    assert_eq!(reloaded.unprocessed[0].phone_number, "5550001111");
    assert_eq!(reloaded.unprocessed[0].contact_names, vec!["Carol".to_owned()]);
    Ok(())
}

#[test]
fn reprocess_dry_run_leaves_file_untouched() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let date = ts("2014-03-01 10:00:00");
    let content = smses_xml(&[sms_xml_named("5550001111", date, "hi", "Carol")]);
    create_named_file(&repo.sms_file(Year(2014)), content.as_bytes());
    let before = fs::read(repo.contacts_path())?;

    let summary = reprocess_contacts(&repo, true)?;
    assert_eq!(summary.unprocessed_after, 1);
    assert_eq!(fs::read(repo.contacts_path())?, before);
    Ok(())
}
