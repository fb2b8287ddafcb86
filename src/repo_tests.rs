use std::fs;

use pretty_assertions::assert_eq;

use super::*;
use crate::prelude::*;

//
// Init (skeleton creation)
//

#[test]
fn init_creates_skeleton() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();

    assert!(repo.marker_path().is_file());
    assert!(repo.contacts_path().is_file());
    assert!(repo.manifest_path().is_file());
    assert!(repo.manifest_checksum_path().is_file());
    for dir in CONTENT_DIRS {
        assert!(repo.root().join(dir).is_dir(), "missing {dir}/");
    }
    // Import-time artifacts must not exist yet.
    assert!(!repo.summary_path().exists());
    assert!(!repo.rejected_dir().exists());
    Ok(())
}

#[test]
fn init_marker_is_current_version() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let marker = repo.read_marker()?;
    assert_eq!(marker.repository_structure_version, STRUCTURE_VERSION);
    assert!(parse_rfc3339(&marker.created_at).is_ok());
    assert!(marker.created_by.starts_with("mobilecombackup "));
    Ok(())
}

#[test]
fn init_refuses_non_empty_target() -> EmptyRes {
    let dir = new_temp_dir();
    fs::write(dir.path().join("occupant"), b"x")?;
    assert!(Repository::init(dir.path()).is_err());
    Ok(())
}

#[test]
fn init_accepts_missing_target() -> EmptyRes {
    let dir = new_temp_dir();
    let repo = Repository::init(&dir.path().join("deeper").join("repo"))?;
    assert!(repo.marker_path().is_file());
    Ok(())
}

//
// Marker checks
//

#[test]
fn check_marker_rejects_future_version() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    repo.write_marker(&Marker {
        repository_structure_version: "2".to_owned(),
        created_at: now_rfc3339(),
        created_by: "elsewhere".to_owned(),
    })?;
    let err = repo.check_marker().unwrap_err();
    assert!(matches!(pipeline_error(&err),
                     Some(PipelineError::UnsupportedVersion { found }) if found == "2"));
    Ok(())
}

//
// Path handling
//

#[test]
fn resolve_confines_to_root() {
    let (_dir, repo) = init_temp_repo();
    assert!(repo.resolve("calls/calls-2014.xml").is_ok());
    assert!(repo.resolve("../escape").is_err());
}

#[test]
fn relativize_uses_forward_slashes() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let abs = repo.root().join("attachments").join("ab").join("abcd");
    assert_eq!(repo.relativize(&abs)?, "attachments/ab/abcd");
    Ok(())
}

#[test]
fn partition_paths_follow_layout() {
    let (_dir, repo) = init_temp_repo();
    assert!(repo.calls_file(Year(2014)).ends_with("calls/calls-2014.xml"));
    assert!(repo.sms_file(Year(2015)).ends_with("sms/sms-2015.xml"));
}

#[test]
fn year_of_partition_parses_both_kinds() {
    assert_eq!(year_of_partition(Path::new("calls-2014.xml")), Some(Year(2014)));
    assert_eq!(year_of_partition(Path::new("sms-1999.xml")), Some(Year(1999)));
    assert_eq!(year_of_partition(Path::new("sms-latest.xml")), None);
    assert_eq!(year_of_partition(Path::new("files.yaml")), None);
}

//
// Locking
//

#[test]
fn lock_is_exclusive_and_released() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    {
        let _lock = repo.lock()?;
        assert!(repo.lock().is_err());
    }
    // Dropped; takeable again.
    let _relock = repo.lock()?;
    Ok(())
}

#[test]
fn lock_file_is_not_in_manifest() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let _lock = repo.lock()?;
    let entries = manifest::build_manifest(&repo)?;
    assert!(entries.iter().all(|e| e.file != LOCK_FILENAME));
    Ok(())
}
