use std::collections::BTreeMap;

use serde::Serialize;

use crate::prelude::*;

#[cfg(test)]
#[path = "coalescer_tests.rs"]
mod tests;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Duplicate,
}

#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct YearCounters {
    pub initial: u64,
    pub added: u64,
    pub duplicates: u64,
}

/// In-memory merge structure for one entity kind: ingests records, rejects
/// duplicates by fingerprint, groups by UTC year.
///
/// One importer run owns exactly one coalescer per kind; it is replaced, not
/// shared, which is what keeps fingerprinting race-free.
pub struct Coalescer<T> {
    index: HashSet<Fingerprint>,
    by_year: BTreeMap<Year, Vec<(Fingerprint, T)>>,
    counters: BTreeMap<Year, YearCounters>,
}

impl<T> Coalescer<T> {
    pub fn new() -> Self {
        Coalescer {
            index: HashSet::new(),
            by_year: BTreeMap::new(),
            counters: BTreeMap::new(),
        }
    }

    /// Seeds the fingerprint index from records already in the repository.
    /// Seed duplicates are tolerated (the repository wins no matter what).
    pub fn load_existing(&mut self, year: Year, records: Vec<(Fingerprint, T)>) {
        let counters = self.counters.entry(year).or_default();
        for (fingerprint, record) in records {
            if self.index.insert(fingerprint) {
                counters.initial += 1;
                self.by_year.entry(year).or_default().push((fingerprint, record));
            } else {
                log::warn!("Repository year {year} contains duplicate record {fingerprint:?}");
            }
        }
    }

    pub fn add(&mut self, year: Year, fingerprint: Fingerprint, record: T) -> AddOutcome {
        let counters = self.counters.entry(year).or_default();
        if !self.index.insert(fingerprint) {
            counters.duplicates += 1;
            return AddOutcome::Duplicate;
        }
        counters.added += 1;
        self.by_year.entry(year).or_default().push((fingerprint, record));
        AddOutcome::Added
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.index.contains(fingerprint)
    }

    pub fn years(&self) -> Vec<Year> {
        self.by_year.keys().copied().collect()
    }

    /// Years whose content changed in this run.
    pub fn affected_years(&self) -> Vec<Year> {
        self.counters.iter()
            .filter(|(_, c)| c.added > 0)
            .map(|(year, _)| *year)
            .collect()
    }

    pub fn counters(&self) -> &BTreeMap<Year, YearCounters> {
        &self.counters
    }

    pub fn total_records(&self) -> u64 {
        self.by_year.values().map(|records| records.len() as u64).sum()
    }

    /// Verifies `initial + added == final` per year. A mismatch is a logic
    /// error that must not fail the run, only surface it.
    pub fn verify_counters(&self) -> Vec<String> {
        let mut mismatches = vec![];
        for (year, counters) in &self.counters {
            let finals = self.by_year.get(year).map(|r| r.len() as u64).unwrap_or(0);
            if counters.initial + counters.added != finals {
                mismatches.push(format!(
                    "year {year}: initial {} + added {} != final {finals}",
                    counters.initial, counters.added));
            }
        }
        mismatches
    }
}

impl<T: DatedRecord> Coalescer<T> {
    /// Stable-sorted output for one year: date ascending, fingerprint as the
    /// tie breaker.
    pub fn records_for_year(&self, year: Year) -> Vec<&T> {
        let mut records: Vec<&(Fingerprint, T)> =
            self.by_year.get(&year).map(|r| r.iter().collect()).unwrap_or_default();
        records.sort_by_key(|(fingerprint, record)| (record.date(), *fingerprint));
        records.iter().map(|(_, record)| record).collect()
    }
}

impl<T> Default for Coalescer<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub trait DatedRecord {
    fn date(&self) -> Timestamp;
}

impl DatedRecord for Call {
    fn date(&self) -> Timestamp {
        self.date
    }
}

impl DatedRecord for Message {
    fn date(&self) -> Timestamp {
        Message::date(self)
    }
}
