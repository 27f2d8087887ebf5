//! Back up every repository visible to a GitHub account into object storage
//! as self-contained git bundles, only re-uploading repositories whose
//! branches have moved since the last run.

#[macro_use]
extern crate log;

pub mod backup;
pub mod config;
pub mod driver;
pub mod errors;
pub mod fingerprint;
pub mod git;
pub mod github;
pub mod notify;
pub mod stale;
pub mod store;
pub mod utils;

pub use crate::config::Config;
pub use crate::driver::{Driver, Summary, UpdateFailure};
pub use crate::errors::{BackupError, ErrorKind};

use async_trait::async_trait;
use url::Url;

/// The suffix given to every backup object.
pub const BUNDLE_EXTENSION: &str = "bundle";

/// A repository we may want to back up, as seen during this run.
#[derive(Debug, Clone, PartialEq)]
pub struct Repo {
    /// The `owner/name` identifier, unique within the provider.
    pub full_name: String,
    /// Where to clone from. Only ever carries a username, never a token.
    pub clone_url: Url,
    /// The key this repository's bundle is stored under.
    pub backup_filename: String,
    pub fingerprint: String,
}

impl Repo {
    pub fn new(full_name: &str, clone_url: Url, fingerprint: String) -> Repo {
        Repo {
            full_name: full_name.to_string(),
            clone_url,
            backup_filename: backup_filename(full_name),
            fingerprint,
        }
    }
}

/// Get the name of the object a repository gets backed up to.
///
/// ```rust
/// assert_eq!(
///     bundle_backup::backup_filename("alice/demo"),
///     "github_alice_demo.bundle"
/// );
/// ```
pub fn backup_filename(full_name: &str) -> String {
    format!("github_{}.{}", full_name.replace('/', "_"), BUNDLE_EXTENSION)
}

/// Something which can retrieve the repositories we want to backup.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn repositories(&self) -> Result<Vec<Repo>, BackupError>;
}
