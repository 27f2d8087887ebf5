use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use failure::{Error, Fail, ResultExt};

use crate::backup::Executor;
use crate::config::Config;
use crate::errors::BackupError;
use crate::git::GitCli;
use crate::github::GitHub;
use crate::notify::Notifier;
use crate::stale::resolve_stale;
use crate::store::{self, BackupStore, ObjectStoreBackend, StoredBackup};
use crate::{Provider, Repo};

/// Knobs which change how a run behaves, without changing what it backs up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    /// Work out what is stale, but don't back anything up.
    pub dry_run: bool,
    /// Stop at the first repository which fails instead of carrying on.
    pub fail_fast: bool,
    /// The longest a single repository may take.
    pub timeout: Option<Duration>,
}

/// What happened during a successful run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Summary {
    /// How many repositories were found.
    pub total: usize,
    /// The repositories which needed a new backup.
    pub stale: Vec<String>,
    /// The repositories which were actually backed up.
    pub backed_up: Vec<String>,
}

/// Runs the whole backup process, from listing repositories to pinging the
/// monitor.
pub struct Driver {
    providers: Vec<Box<dyn Provider>>,
    store: Arc<dyn BackupStore>,
    executor: Executor,
    notifier: Option<Notifier>,
    options: Options,
}

impl Driver {
    pub fn new(providers: Vec<Box<dyn Provider>>, store: Arc<dyn BackupStore>, executor: Executor) -> Driver {
        Driver {
            providers,
            store,
            executor,
            notifier: None,
            options: Options::default(),
        }
    }

    /// Wire up the real GitHub, S3 and `git` implementations.
    pub fn with_config(cfg: &Config, options: Options) -> Result<Driver, Error> {
        let github = GitHub::with_config(cfg.github.clone())
            .context("Unable to create the GitHub client")?;
        let store: Arc<dyn BackupStore> = Arc::new(
            ObjectStoreBackend::from_config(&cfg.storage)
                .context("Unable to connect to the backup store")?,
        );
        let executor = Executor::new(
            Arc::clone(&store),
            Arc::new(GitCli::default()),
            cfg.github.credentials.clone(),
        )
        .with_scratch_dir(cfg.general.scratch_dir.clone());

        Ok(Driver::new(vec![Box::new(github)], store, executor)
            .with_notifier(cfg.notify.as_ref().map(Notifier::with_config))
            .with_options(options))
    }

    pub fn with_notifier(mut self, notifier: Option<Notifier>) -> Driver {
        self.notifier = notifier;
        self
    }

    pub fn with_options(mut self, options: Options) -> Driver {
        self.options = options;
        self
    }

    pub async fn run(&self) -> Result<Summary, Error> {
        let (repos, stored) = futures::try_join!(self.get_repos_from_providers(), self.get_stored_backups())?;

        let stale = resolve_stale(&repos, &stored);
        info!(
            "Found {} repositories of which {} need new backups",
            repos.len(),
            stale.len()
        );

        let mut summary = Summary {
            total: repos.len(),
            stale: stale.iter().map(|r| r.full_name.clone()).collect(),
            backed_up: Vec::new(),
        };

        if self.options.dry_run {
            for repo in &stale {
                info!("Would back up {} to {}", repo.full_name, repo.backup_filename);
            }
            return Ok(summary);
        }

        summary.backed_up = self.update_repos(&stale).await?;

        if let Some(notifier) = self.notifier.as_ref() {
            notifier.ping().await.context("Unable to notify the monitor")?;
        }

        info!("Done");
        Ok(summary)
    }

    async fn get_repos_from_providers(&self) -> Result<Vec<Repo>, Error> {
        let mut repos = Vec::new();

        for provider in &self.providers {
            info!("Fetching repositories from {}", provider.name());
            let found = provider
                .repositories()
                .await
                .context("Unable to fetch repositories")?;

            info!("Found {} repos from {}", found.len(), provider.name());
            repos.extend(found);
        }

        Ok(repos)
    }

    async fn get_stored_backups(&self) -> Result<Vec<StoredBackup>, Error> {
        let stored = store::inspect(&*self.store)
            .await
            .context("Unable to inspect the backup store")?;

        debug!("Found {} existing backups", stored.len());
        Ok(stored)
    }

    /// Back up each repository in turn, returning the names of the ones
    /// which succeeded.
    async fn update_repos(&self, repos: &[&Repo]) -> Result<Vec<String>, Error> {
        info!("Updating repositories");
        let mut backed_up = Vec::new();
        let mut errors = Vec::new();

        for repo in repos {
            match self.update_repo(repo).await {
                Ok(()) => backed_up.push(repo.full_name.clone()),
                Err(e) if self.options.fail_fast || !e.is_per_repository() => {
                    return Err(e
                        .context(format!("Updating {} failed", repo.full_name))
                        .into());
                }
                Err(e) => {
                    warn!("Updating {} failed, {}", repo.full_name, e);
                    errors.push((repo.full_name.clone(), e));
                }
            }
        }

        if errors.is_empty() {
            Ok(backed_up)
        } else {
            Err(UpdateFailure { errors }.into())
        }
    }

    async fn update_repo(&self, repo: &Repo) -> Result<(), BackupError> {
        debug!("Updating {}", repo.full_name);

        match self.options.timeout {
            Some(limit) => tokio::time::timeout(limit, self.executor.backup(repo))
                .await
                .unwrap_or_else(|_| {
                    Err(BackupError::Timeout {
                        repo: repo.full_name.clone(),
                        limit,
                    })
                }),
            None => self.executor.backup(repo).await,
        }
    }
}

#[derive(Debug, Fail)]
#[fail(display = "One or more errors encountered while updating repos")]
pub struct UpdateFailure {
    errors: Vec<(String, BackupError)>,
}

impl UpdateFailure {
    pub fn errors(&self) -> &[(String, BackupError)] {
        &self.errors
    }

    pub fn display<W: Write>(&self, writer: &mut W) -> Result<(), Error> {
        writeln!(
            writer,
            "There were {} errors updating repositories",
            self.errors.len()
        )?;

        for &(ref repo, ref err) in &self.errors {
            writeln!(writer, "Error: {} failed with {}", repo, err)?;
        }

        Ok(())
    }
}
