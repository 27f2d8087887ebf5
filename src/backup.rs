use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::config::Credentials;
use crate::errors::BackupError;
use crate::git::Vcs;
use crate::store::{BackupStore, Metadata, FINGERPRINT_METADATA_KEY};
use crate::Repo;

/// A private scratch directory, deleted (along with everything inside it)
/// when dropped.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a new workspace inside `parent`, or the system's temporary
    /// directory if there isn't one.
    pub fn new(parent: Option<&Path>) -> Result<Workspace, BackupError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("bundle-backup-");

        let dir = match parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|e| BackupError::Workspace {
            path: parent
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| String::from("<temp dir>")),
            reason: e.to_string(),
        })?;

        trace!("Created workspace {}", dir.path().display());
        Ok(Workspace { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Delete the workspace, reporting any errors instead of silently
    /// ignoring them the way dropping it would.
    pub fn close(self) -> Result<(), BackupError> {
        let path = self.dir.path().display().to_string();

        self.dir.close().map_err(|e| BackupError::Workspace {
            path,
            reason: e.to_string(),
        })
    }
}

/// Recursively delete a directory. It's fine if the directory is already
/// gone.
pub async fn remove_tree(path: &Path) -> Result<(), BackupError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(_) => Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackupError::Workspace {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Turns a single out of date repository into an up to date backup.
#[derive(Clone)]
pub struct Executor {
    store: Arc<dyn BackupStore>,
    vcs: Arc<dyn Vcs>,
    credentials: Credentials,
    scratch_dir: Option<PathBuf>,
}

impl Executor {
    pub fn new(store: Arc<dyn BackupStore>, vcs: Arc<dyn Vcs>, credentials: Credentials) -> Executor {
        Executor {
            store,
            vcs,
            credentials,
            scratch_dir: None,
        }
    }

    /// Create workspaces inside `dir` instead of the system temp directory.
    pub fn with_scratch_dir(mut self, dir: Option<PathBuf>) -> Executor {
        self.scratch_dir = dir;
        self
    }

    /// Backup a single repository.
    ///
    /// The repository is mirror-cloned into a fresh workspace, packed into a
    /// bundle, and the bundle is uploaded under the repo's
    /// `backup_filename` with its fingerprint attached. The workspace is
    /// removed no matter how this ends, including when the returned future
    /// is dropped part way through.
    pub async fn backup(&self, repo: &Repo) -> Result<(), BackupError> {
        let workspace = Workspace::new(self.scratch_dir.as_deref())?;
        let clone_dir = workspace.path().join("repo");
        let bundle = workspace.path().join(&repo.backup_filename);

        info!("Cloning {}...", repo.clone_url);
        self.vcs
            .clone_mirror(&repo.clone_url, &clone_dir, &self.credentials)
            .await?;

        info!("Creating bundle {}...", repo.backup_filename);
        self.vcs.create_bundle(&clone_dir, &bundle).await?;

        // Free up the disk space before the upload starts
        remove_tree(&clone_dir).await?;

        info!("Uploading {}...", repo.backup_filename);
        let mut metadata = Metadata::new();
        metadata.insert(
            FINGERPRINT_METADATA_KEY.to_string(),
            repo.fingerprint.clone(),
        );
        self.store
            .put_object(&repo.backup_filename, &bundle, &metadata)
            .await?;

        workspace.close()?;
        info!("{} is up to date", repo.full_name);

        Ok(())
    }
}

impl Debug for Executor {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Executor")
            .field("credentials", &self.credentials)
            .field("scratch_dir", &self.scratch_dir)
            .finish()
    }
}
