//! Working out which repositories need a new backup.

use std::collections::HashMap;

use crate::store::StoredBackup;
use crate::Repo;

/// Get the repositories whose backup is missing, or was taken when their
/// branches looked different.
///
/// Repositories keep the order they were listed in. Backups for repositories
/// which no longer exist upstream are left alone.
pub fn resolve_stale<'r>(repos: &'r [Repo], stored: &[StoredBackup]) -> Vec<&'r Repo> {
    let recorded: HashMap<&str, Option<&str>> = stored
        .iter()
        .map(|backup| {
            (
                backup.backup_filename.as_str(),
                backup.fingerprint.as_deref(),
            )
        })
        .collect();

    repos
        .iter()
        .filter(|repo| match recorded.get(repo.backup_filename.as_str()) {
            Some(&Some(fingerprint)) => fingerprint != repo.fingerprint,
            Some(&None) => true,
            None => true,
        })
        .collect()
}
