use std::fs;

use serde::{Deserialize, Serialize};

use crate::prelude::*;
use crate::repo::{self, Repository};
use crate::utils::atomic;

/// Reduced statistics file, written only by import.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub last_updated: String,
    pub total_calls: u64,
    pub total_sms: u64,
    pub years_covered: Vec<i32>,
}

impl Summary {
    pub fn read_from(repo: &Repository) -> Result<Option<Summary>> {
        let path = repo.summary_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read {path:?}"))?;
        let summary = serde_yaml::from_str(&content)
            .with_context(|| format!("Summary file {path:?} is not valid YAML"))?;
        Ok(Some(summary))
    }

    pub fn write_to(&self, repo: &Repository) -> EmptyRes {
        atomic::write_file(&repo.summary_path(), &repo::to_canonical_yaml(self)?)
    }
}
