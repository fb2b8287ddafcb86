use std::collections::BTreeMap;
use std::fs;

use serde::Serialize;

use crate::prelude::*;
use crate::repo::{self, Repository};
use crate::xml::{CALLS_ROOT, SMSES_ROOT};

#[cfg(test)]
#[path = "info_tests.rs"]
mod tests;

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct KindCounts {
    pub calls: BTreeMap<i32, u64>,
    pub sms: BTreeMap<i32, u64>,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct FamilyStats {
    pub count: u64,
    pub size_bytes: u64,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AttachmentInfo {
    pub count: u64,
    pub total_size_bytes: u64,
    pub by_family: BTreeMap<String, FamilyStats>,
    pub orphaned: u64,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ContactCounts {
    pub known: u64,
    pub unprocessed: u64,
}

#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct RejectionCounts {
    pub calls: u64,
    pub sms: u64,
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub repository_structure_version: String,
    pub created_at: String,
    pub counts: KindCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub earliest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<String>,
    pub attachments: AttachmentInfo,
    pub contacts: ContactCounts,
    pub rejections: RejectionCounts,
}

/// Read-only, streaming pass over the repository. Tolerates everything but a
/// missing or unreadable marker.
pub fn gather_info(repo: &Repository) -> Result<RepositoryInfo> {
    let marker = repo.read_marker()?;

    let mut counts = KindCounts::default();
    let mut earliest: Option<Timestamp> = None;
    let mut latest: Option<Timestamp> = None;
    // blob hash -> MIME family claimed by the referencing part
    let mut families: HashMap<String, String> = HashMap::new();

    for path in repo::list_partitions(&repo.calls_dir())? {
        let Some(year) = repo::year_of_partition(&path) else { continue };
        let records = repo::read_partition(&path, Default::default(), CALLS_ROOT, Call::from_xml)?;
        *counts.calls.entry(*year).or_default() += records.len() as u64;
        for call in &records {
            track_range(&mut earliest, &mut latest, call.date);
        }
    }
    for path in repo::list_partitions(&repo.sms_dir())? {
        let Some(year) = repo::year_of_partition(&path) else { continue };
        let records =
            repo::read_partition(&path, Default::default(), SMSES_ROOT, repo::message_from_xml)?;
        *counts.sms.entry(*year).or_default() += records.len() as u64;
        for message in &records {
            track_range(&mut earliest, &mut latest, message.date());
            if let Message::Mms(mms) = message {
                for part in &mms.parts {
                    if let Some(hash) = part.blob_hash() {
                        families.insert(hash.to_owned(), mime_family(&part.ct));
                    }
                }
            }
        }
    }

    let attachments = attachment_info(repo, &families)?;
    let contacts_file = repo::contacts::ContactsFile::read_from(repo)?;
    let rejections = rejection_counts(repo)?;

    Ok(RepositoryInfo {
        repository_structure_version: marker.repository_structure_version,
        created_at: marker.created_at,
        counts,
        earliest: earliest.map(format_ts),
        latest: latest.map(format_ts),
        attachments,
        contacts: ContactCounts {
            known: contacts_file.contacts.len() as u64,
            unprocessed: contacts_file.unprocessed.len() as u64,
        },
        rejections,
    })
}

fn track_range(earliest: &mut Option<Timestamp>, latest: &mut Option<Timestamp>, ts: Timestamp) {
    if earliest.map(|e| ts < e).unwrap_or(true) {
        *earliest = Some(ts);
    }
    if latest.map(|l| ts > l).unwrap_or(true) {
        *latest = Some(ts);
    }
}

fn format_ts(ts: Timestamp) -> String {
    use chrono::TimeZone;
    chrono::Utc.timestamp_millis_opt(*ts).single()
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ts.to_string())
}

fn mime_family(ct: &str) -> String {
    ct.split('/').next().unwrap_or("unknown").to_ascii_lowercase()
}

fn attachment_info(repo: &Repository,
                   families: &HashMap<String, String>) -> Result<AttachmentInfo> {
    let mut info = AttachmentInfo::default();
    for hash in crate::repo::attachments::list_blobs(repo)? {
        let path = repo.attachments_dir().join(&hash[..2]).join(&hash);
        let size = fs::metadata(&path)
            .with_context(|| format!("Cannot stat {path:?}"))?
            .len();
        info.count += 1;
        info.total_size_bytes += size;
        let family = match families.get(&hash) {
            Some(family) => family.clone(),
            None => {
                info.orphaned += 1;
                "unreferenced".to_owned()
            }
        };
        let stats = info.by_family.entry(family).or_default();
        stats.count += 1;
        stats.size_bytes += size;
    }
    Ok(info)
}

fn rejection_counts(repo: &Repository) -> Result<RejectionCounts> {
    let mut rejections = RejectionCounts::default();
    for (dir, slot) in [("calls", &mut rejections.calls), ("sms", &mut rejections.sms)] {
        let path = repo.rejected_dir().join(dir);
        if !path.is_dir() {
            continue;
        }
        let count = fs::read_dir(&path)
            .with_context(|| format!("Cannot read {path:?}"))?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
            .count();
        *slot = count as u64;
    }
    Ok(rejections)
}
