extern crate core;

#[macro_use]
extern crate num_derive;

use std::path::Path;

use prelude::*;

pub mod entities;
pub mod import;
pub mod info;
pub mod repo;
pub mod utils;
pub mod validate;
pub mod xml;

pub mod prelude {
    pub use std::collections::{HashMap, HashSet};

    pub use itertools::Itertools;

    pub use crate::*;
    pub use crate::entities::*;
    pub use crate::entities::fingerprint::*;
    pub use crate::utils::*;
    #[cfg(test)]
    pub use crate::utils::test_utils::*;
}

//
// Entry points
//

pub fn init_repository(target: &Path) -> Result<repo::Repository> {
    repo::Repository::init(target)
}

pub fn import_backups(repo_root: &Path,
                      options: &import::ImportOptions) -> Result<import::ImportSummary> {
    let repo = repo::Repository::open(repo_root)?;
    repo.check_marker()?;
    import::import(&repo, options)
}

pub fn validate_repository(repo_root: &Path) -> Result<validate::ValidationReport> {
    let repo = repo::Repository::open(repo_root)?;
    validate::validate(&repo, validate::ValidationScope::Full)
}

pub fn repository_info(repo_root: &Path) -> Result<info::RepositoryInfo> {
    let repo = repo::Repository::open(repo_root)?;
    info::gather_info(&repo)
}
