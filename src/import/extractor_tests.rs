use pretty_assertions::assert_eq;

use super::*;
use crate::prelude::*;
use crate::repo::attachments;

const RUN_TS: &str = "2015-06-02T00:00:00Z";

fn extract(repo: &crate::repo::Repository, mms: &mut Mms) -> Result<ExtractionStats> {
    let mut stats = ExtractionStats::default();
    extract_mms_parts(repo, mms, RUN_TS, false, &mut stats)?;
    Ok(stats)
}

//
// Decision table
//

#[test]
fn extractable_set_covers_media_and_documents() {
    assert!(is_extractable("image/jpeg"));
    assert!(is_extractable("IMAGE/PNG"));
    assert!(is_extractable("video/mp4"));
    assert!(is_extractable("audio/amr"));
    assert!(is_extractable("application/pdf"));
    assert!(is_extractable("application/vnd.openxmlformats-officedocument.wordprocessingml.document"));

    assert!(!is_extractable("application/smil"));
    assert!(!is_extractable("text/plain"));
    assert!(!is_extractable("application/octet-stream"));
}

#[test]
fn extracts_large_image_part() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let payload = jpeg_bytes(2 * 1024 * 1024);
    let hash = hashing::hash_bytes(&payload);
    let mut mms = make_mms("555", ts("2015-06-01 12:00:00"),
                           vec![make_part(0, "image/jpeg", Some(b64(&payload)))]);

    let stats = extract(&repo, &mut mms)?;
    assert_eq!(stats.parts_extracted, 1);
    assert_eq!(stats.blobs_written, 1);

    let part = &mms.parts[0];
    assert_eq!(part.data, None);
    assert_eq!(part.path.as_deref(), Some(attachments::blob_rel_path(&hash).as_str()));
    assert_eq!(part.original_size, Some(payload.len() as u64));
    assert_eq!(part.extraction_date.as_deref(), Some(RUN_TS));
    assert!(attachments::blob_exists(&repo, &hash));
    Ok(())
}

#[test]
fn leaves_smil_and_text_inline() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let smil = b64(b"<smil><body/></smil>");
    let mut mms = make_mms("555", ts("2015-06-01 12:00:00"), vec![
        make_part(0, "application/smil", Some(smil.clone())),
        make_part(1, "text/plain", Some(b64(b"inline text"))),
    ]);

    let stats = extract(&repo, &mut mms)?;
    assert_eq!(stats.parts_extracted, 0);
    assert_eq!(mms.parts[0].data.as_deref(), Some(smil.as_str()));
    assert_eq!(mms.parts[0].path, None);
    assert_eq!(attachments::list_blobs(&repo)?.len(), 0);
    Ok(())
}

#[test]
fn leaves_unknown_type_inline_without_failing() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let data = b64(&jpeg_bytes(4096));
    let mut mms = make_mms("555", ts("2015-06-01 12:00:00"),
                           vec![make_part(0, "application/x-something-new", Some(data.clone()))]);

    let stats = extract(&repo, &mut mms)?;
    assert_eq!(stats.parts_extracted, 0);
    assert_eq!(mms.parts[0].data.as_deref(), Some(data.as_str()));
    Ok(())
}

#[test]
fn small_parts_stay_inline_as_metadata() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let tiny = jpeg_bytes(512);
    let mut mms = make_mms("555", ts("2015-06-01 12:00:00"),
                           vec![make_part(0, "image/jpeg", Some(b64(&tiny)))]);

    let stats = extract(&repo, &mut mms)?;
    assert_eq!(stats.parts_extracted, 0);
    assert!(mms.parts[0].data.is_some());
    assert_eq!(attachments::list_blobs(&repo)?.len(), 0);
    Ok(())
}

#[test]
fn partless_mms_is_untouched() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let mut mms = make_mms("555", ts("2015-06-01 12:00:00"),
                           vec![make_part(0, "image/jpeg", None)]);
    let stats = extract(&repo, &mut mms)?;
    assert_eq!(stats.parts_extracted, 0);
    Ok(())
}

//
// Failures
//

#[test]
fn bad_base64_rejects_the_mms() {
    let (_dir, repo) = init_temp_repo();
    let mut mms = make_mms("555", ts("2015-06-01 12:00:00"),
                           vec![make_part(0, "image/jpeg", Some("@@garbage@@".to_owned()))]);
    let err = extract(&repo, &mut mms).unwrap_err();
    assert!(matches!(pipeline_error(&err), Some(PipelineError::AttachmentDecode { .. })));
}

#[test]
fn earlier_blobs_survive_a_later_failure() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let good = jpeg_bytes(4096);
    let good_hash = hashing::hash_bytes(&good);
    let mut mms = make_mms("555", ts("2015-06-01 12:00:00"), vec![
        make_part(0, "image/jpeg", Some(b64(&good))),
        make_part(1, "image/png", Some("@@garbage@@".to_owned())),
    ]);

    assert!(extract(&repo, &mut mms).is_err());
    // Content-addressed writes are never rolled back.
    assert!(attachments::blob_exists(&repo, &good_hash));
    Ok(())
}

//
// Dedup and dry-run
//

#[test]
fn second_extraction_writes_no_new_blob() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let payload = jpeg_bytes(4096);
    let mut first = make_mms("555", ts("2015-06-01 12:00:00"),
                             vec![make_part(0, "image/jpeg", Some(b64(&payload)))]);
    let mut second = make_mms("666", ts("2015-06-03 12:00:00"),
                              vec![make_part(0, "image/jpeg", Some(b64(&payload)))]);

    assert_eq!(extract(&repo, &mut first)?.blobs_written, 1);
    let stats = extract(&repo, &mut second)?;
    assert_eq!(stats.parts_extracted, 1);
    assert_eq!(stats.blobs_written, 0);
    Ok(())
}

#[test]
fn dry_run_rewrites_part_without_writing() -> EmptyRes {
    let (_dir, repo) = init_temp_repo();
    let payload = jpeg_bytes(4096);
    let hash = hashing::hash_bytes(&payload);
    let mut mms = make_mms("555", ts("2015-06-01 12:00:00"),
                           vec![make_part(0, "image/jpeg", Some(b64(&payload)))]);

    let mut stats = ExtractionStats::default();
    extract_mms_parts(&repo, &mut mms, RUN_TS, true, &mut stats)?;

    assert_eq!(stats.parts_extracted, 1);
    assert_eq!(stats.blobs_written, 0);
    // Same reference as a real run, so fingerprints agree.
    assert_eq!(mms.parts[0].path.as_deref(), Some(attachments::blob_rel_path(&hash).as_str()));
    assert!(!attachments::blob_exists(&repo, &hash));
    Ok(())
}
