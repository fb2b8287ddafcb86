use std::collections::BTreeMap;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::prelude::*;
use crate::repo::{self, Repository};
use crate::utils::atomic;

#[cfg(test)]
#[path = "contacts_tests.rs"]
mod tests;

pub const UNKNOWN_CONTACT_NAME: &str = "<unknown>";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Contact {
    pub name: String,
    pub numbers: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct UnprocessedEntry {
    pub phone_number: String,
    pub contact_names: Vec<String>,
}

/// On-disk shape of `contacts.yaml`: a curated section and a harvested one.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct ContactsFile {
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub unprocessed: Vec<UnprocessedEntry>,
}

impl ContactsFile {
    pub fn read_from(repo: &Repository) -> Result<ContactsFile> {
        let path = repo.contacts_path();
        if !path.exists() {
            return Ok(ContactsFile::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {path:?}"))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Contacts file {path:?} is not valid YAML"))
    }

    pub fn write_to(&self, repo: &Repository) -> EmptyRes {
        atomic::write_file(&repo.contacts_path(), &repo::to_canonical_yaml(self)?)
    }
}

/// In-memory contacts state for one run: curated numbers are an index,
/// harvested pairs accumulate per normalized phone number.
pub struct ContactsStore {
    contacts: Vec<Contact>,
    /// normalized number -> curated contact name
    known_numbers: HashMap<String, String>,
    /// normalized number -> names in order of first appearance
    unprocessed: BTreeMap<String, Vec<String>>,
    dirty: bool,
}

impl ContactsStore {
    pub fn load(repo: &Repository) -> Result<ContactsStore> {
        Ok(Self::from_file(ContactsFile::read_from(repo)?))
    }

    pub fn from_file(file: ContactsFile) -> ContactsStore {
        let mut known_numbers = HashMap::new();
        for contact in &file.contacts {
            for number in &contact.numbers {
                known_numbers.insert(normalize_number(number), contact.name.clone());
            }
        }
        let unprocessed = file.unprocessed.into_iter()
            .map(|e| (e.phone_number, e.contact_names))
            .collect();
        ContactsStore {
            contacts: file.contacts,
            known_numbers,
            unprocessed,
            dirty: false,
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn unprocessed_len(&self) -> usize {
        self.unprocessed.len()
    }

    /// Harvests (phone, name) pairs from one record's address and
    /// contact_name attributes. Group addresses split on `~`, names on `,`;
    /// a count mismatch rejects the enclosing record since pairing by
    /// position would be a guess.
    pub fn harvest(&mut self, address: &str, contact_name: &str) -> EmptyRes {
        let addresses = split_addresses(address);
        let names: Vec<&str> = contact_name.split(',').map(str::trim).collect();
        if addresses.len() != names.len() {
            return Err(PipelineError::RecordInvalid {
                reason: format!("contact-name-mismatch: {} addresses vs {} names",
                                addresses.len(), names.len()),
            }.into());
        }
        for (raw_number, name) in addresses.iter().zip(names.iter()) {
            if name.is_empty() || *name == UNKNOWN_CONTACT || *name == NULL_VALUE {
                continue;
            }
            let number = normalize_number(raw_number);
            if self.known_numbers.contains_key(&number) {
                continue;
            }
            let names = self.unprocessed.entry(number).or_default();
            if !names.iter().any(|n| n == name) {
                names.push((*name).to_owned());
                self.dirty = true;
            }
        }
        Ok(())
    }

    /// Drops harvested entries whose number is also curated (they are an
    /// invariant violation on disk; autofix funnels through here as well).
    pub fn drop_curated_duplicates(&mut self) -> Vec<String> {
        let known = &self.known_numbers;
        let duplicates: Vec<String> = self.unprocessed.keys()
            .filter(|number| known.contains_key(*number))
            .cloned()
            .collect();
        for number in &duplicates {
            self.unprocessed.remove(number);
            self.dirty = true;
        }
        duplicates
    }

    /// Serializable form; `unprocessed` ascending by phone number for
    /// deterministic output (BTreeMap iteration order).
    pub fn to_file(&self) -> ContactsFile {
        ContactsFile {
            contacts: self.contacts.clone(),
            unprocessed: self.unprocessed.iter()
                .map(|(number, names)| UnprocessedEntry {
                    phone_number: number.clone(),
                    contact_names: names.clone(),
                })
                .collect(),
        }
    }

    pub fn persist(&self, repo: &Repository) -> EmptyRes {
        self.to_file().write_to(repo)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReprocessSummary {
    pub records_scanned: u64,
    pub records_skipped: u64,
    pub unprocessed_before: u64,
    pub unprocessed_after: u64,
}

/// Re-runs the contact harvest over the repository's own partitions,
/// re-reading the `contact_name` attributes retained on stored records.
/// Records whose address/name counts disagree are skipped, not rejected;
/// they are already part of the repository.
pub fn reprocess_contacts(repo: &Repository, dry_run: bool) -> Result<ReprocessSummary> {
    use crate::repo::{expect_root, list_partitions};
    use crate::xml::{RecordReader, XmlLimits, CALLS_ROOT, SMSES_ROOT};

    let mut store = ContactsStore::load(repo)?;
    let mut summary = ReprocessSummary {
        unprocessed_before: store.unprocessed_len() as u64,
        ..Default::default()
    };

    let mut harvest = |store: &mut ContactsStore,
                       summary: &mut ReprocessSummary,
                       address: &str,
                       name: Option<&str>| {
        let Some(name) = name else { return };
        summary.records_scanned += 1;
        if let Err(e) = store.harvest(address, name) {
            log::debug!("Skipping record during reprocess: {}", error_to_string(&e));
            summary.records_skipped += 1;
        }
    };

    for path in list_partitions(&repo.calls_dir())? {
        let reader = RecordReader::open(&path, XmlLimits::default())?;
        expect_root(&reader, CALLS_ROOT, &path)?;
        for elem in reader {
            let call = Call::from_xml(&elem?)?;
            harvest(&mut store, &mut summary, &call.number, call.contact_name.as_deref());
        }
    }
    for path in list_partitions(&repo.sms_dir())? {
        let reader = RecordReader::open(&path, XmlLimits::default())?;
        expect_root(&reader, SMSES_ROOT, &path)?;
        for elem in reader {
            let message = crate::repo::message_from_xml(&elem?)?;
            let (address, name) = message.address_and_contact_name();
            harvest(&mut store, &mut summary, address, name);
        }
    }

    summary.unprocessed_after = store.unprocessed_len() as u64;
    if !dry_run && store.is_dirty() {
        store.persist(repo)?;
        let entries = crate::repo::manifest::build_manifest(repo)?;
        crate::repo::manifest::write_manifest(repo, &entries)?;
    }
    Ok(summary)
}
