//! The errors encountered in this crate.

use std::time::Duration;

use failure::Fail;

/// Everything that can go wrong while backing up repositories.
///
/// Each variant corresponds to exactly one failure point. Use
/// [`BackupError::kind()`] to match on it without the data.
#[derive(Debug, Fail)]
pub enum BackupError {
    /// A namespace source wasn't of the form `/{users,orgs}/<name>/repos`.
    #[fail(display = "\"{}\" is not a valid repository source", source)]
    InvalidSourceSpec { source: String },
    /// Listing the repositories under a namespace failed.
    #[fail(display = "Unable to list repositories for {}: {}", source, reason)]
    ProviderList { source: String, reason: String },
    /// Listing a repository's branches failed.
    #[fail(display = "Unable to list the branches of {}: {}", repo, reason)]
    ProviderBranch { repo: String, reason: String },
    /// A repository with no branches can't be fingerprinted.
    #[fail(display = "{} has no branches", repo)]
    EmptyRepository { repo: String },
    #[fail(display = "Unable to list the objects in the backup store: {}", reason)]
    StoreList { reason: String },
    #[fail(display = "Unable to read the metadata for \"{}\": {}", key, reason)]
    StoreMetadata { key: String, reason: String },
    #[fail(display = "Unable to clone {}: {}", repo, stderr)]
    Clone { repo: String, stderr: String },
    #[fail(display = "Unable to bundle {}: {}", repo, stderr)]
    Bundle { repo: String, stderr: String },
    #[fail(display = "Unable to upload \"{}\": {}", key, reason)]
    Upload { key: String, reason: String },
    #[fail(display = "Unable to ping {}: {}", url, reason)]
    Notification { url: String, reason: String },
    /// A required setting wasn't found in the environment or config file.
    #[fail(display = "Missing required environment value: {}", key)]
    ConfigMissing { key: &'static str },
    #[fail(display = "Invalid value for {}: {}", key, reason)]
    InvalidConfig { key: &'static str, reason: String },
    /// Creating or cleaning up the temporary workspace failed.
    #[fail(display = "Workspace error ({}): {}", path, reason)]
    Workspace { path: String, reason: String },
    #[fail(display = "Backing up {} took longer than {:?}", repo, limit)]
    Timeout { repo: String, limit: Duration },
}

/// The discriminant of a [`BackupError`], without any of its data.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidSourceSpec,
    ProviderList,
    ProviderBranch,
    EmptyRepository,
    StoreList,
    StoreMetadata,
    Clone,
    Bundle,
    Upload,
    Notification,
    ConfigMissing,
    InvalidConfig,
    Workspace,
    Timeout,
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match *self {
            BackupError::InvalidSourceSpec { .. } => ErrorKind::InvalidSourceSpec,
            BackupError::ProviderList { .. } => ErrorKind::ProviderList,
            BackupError::ProviderBranch { .. } => ErrorKind::ProviderBranch,
            BackupError::EmptyRepository { .. } => ErrorKind::EmptyRepository,
            BackupError::StoreList { .. } => ErrorKind::StoreList,
            BackupError::StoreMetadata { .. } => ErrorKind::StoreMetadata,
            BackupError::Clone { .. } => ErrorKind::Clone,
            BackupError::Bundle { .. } => ErrorKind::Bundle,
            BackupError::Upload { .. } => ErrorKind::Upload,
            BackupError::Notification { .. } => ErrorKind::Notification,
            BackupError::ConfigMissing { .. } => ErrorKind::ConfigMissing,
            BackupError::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            BackupError::Workspace { .. } => ErrorKind::Workspace,
            BackupError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Does this error only concern a single repository, leaving the rest of
    /// the batch unaffected?
    pub fn is_per_repository(&self) -> bool {
        match self.kind() {
            ErrorKind::Clone
            | ErrorKind::Bundle
            | ErrorKind::Upload
            | ErrorKind::Workspace
            | ErrorKind::Timeout => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_failures_are_isolatable() {
        let err = BackupError::Clone {
            repo: String::from("alice/demo"),
            stderr: String::from("fatal: repository not found"),
        };
        assert!(err.is_per_repository());

        let err = BackupError::StoreList {
            reason: String::from("access denied"),
        };
        assert!(!err.is_per_repository());
    }

    #[test]
    fn sub_second_timeouts_are_reported_accurately() {
        let err = BackupError::Timeout {
            repo: String::from("alice/demo"),
            limit: Duration::from_millis(250),
        };

        assert_eq!(
            err.to_string(),
            "Backing up alice/demo took longer than 250ms"
        );
    }

    #[test]
    fn config_diagnostic_names_the_variable() {
        let err = BackupError::ConfigMissing { key: "AWS_BUCKET" };

        assert_eq!(err.kind(), ErrorKind::ConfigMissing);
        assert_eq!(
            err.to_string(),
            "Missing required environment value: AWS_BUCKET"
        );
    }
}
