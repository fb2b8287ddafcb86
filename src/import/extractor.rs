use crate::prelude::*;
use crate::repo::attachments;
use crate::repo::Repository;

#[cfg(test)]
#[path = "extractor_tests.rs"]
mod tests;

/// Parts smaller than this decoded are SMIL-era metadata, not attachments.
const MIN_EXTRACT_SIZE: usize = 1024;

/// Content types that stay inline no matter what: layout, plain text,
/// contact cards and WAP envelope wrappers.
const SKIPPED_TYPES: [&str; 4] = [
    "application/smil",
    "text/plain",
    "text/x-vCard",
    "text/vcard",
];

const SKIPPED_PREFIXES: [&str; 1] = ["application/vnd.wap.multipart"];

const EXTRACTABLE_PREFIXES: [&str; 3] = ["image/", "video/", "audio/"];

const EXTRACTABLE_TYPES: [&str; 4] = [
    "application/pdf",
    "application/msword",
    "application/vnd.ms-excel",
    "application/vnd.ms-powerpoint",
];

const EXTRACTABLE_TYPE_PREFIXES: [&str; 1] = ["application/vnd.openxmlformats-officedocument."];

fn is_skipped(ct: &str) -> bool {
    SKIPPED_TYPES.iter().any(|t| ct.eq_ignore_ascii_case(t))
        || SKIPPED_PREFIXES.iter().any(|p| ct.to_ascii_lowercase().starts_with(p))
}

/// Whether a content type belongs to the extractable media and document
/// families. Unknown types are deliberately NOT extractable: they stay
/// inline with a debug event, and never fail the import.
pub fn is_extractable(ct: &str) -> bool {
    let ct = ct.to_ascii_lowercase();
    EXTRACTABLE_PREFIXES.iter().any(|p| ct.starts_with(p))
        || EXTRACTABLE_TYPES.iter().any(|t| ct == *t)
        || EXTRACTABLE_TYPE_PREFIXES.iter().any(|p| ct.starts_with(p))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtractionStats {
    pub parts_extracted: u64,
    pub blobs_written: u64,
    pub bytes_decoded: u64,
}

/// Runs the per-part decision table over one MMS, before dedup.
///
/// Any failure on an extractable part rejects the MMS as a whole; blobs
/// already written for it are kept, they are content-addressed and future
/// imports may reference them.
///
/// In dry-run mode hashes are computed but nothing is written, so the
/// fingerprint (which hashes part payloads) is identical either way.
pub fn extract_mms_parts(repo: &Repository,
                         mms: &mut Mms,
                         run_timestamp: &str,
                         dry_run: bool,
                         stats: &mut ExtractionStats) -> EmptyRes {
    for part in &mut mms.parts {
        let Some(data) = part.data.as_deref() else {
            continue;
        };
        if !is_extractable(&part.ct) {
            if !is_skipped(&part.ct) {
                log::debug!("Leaving part with unknown content type '{}' inline", part.ct);
            }
            continue;
        }

        let bytes = decode_base64(data)?;
        if bytes.len() < MIN_EXTRACT_SIZE {
            continue;
        }

        let hash = if dry_run {
            hashing::hash_bytes(&bytes)
        } else {
            let (hash, written) = attachments::store_blob(repo, &bytes)?;
            if written {
                stats.blobs_written += 1;
            }
            hash
        };

        part.data = None;
        part.path = Some(attachments::blob_rel_path(&hash));
        part.original_size = Some(bytes.len() as u64);
        part.extraction_date = Some(run_timestamp.to_owned());
        stats.parts_extracted += 1;
        stats.bytes_decoded += bytes.len() as u64;
    }
    Ok(())
}
