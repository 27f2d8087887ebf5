//! Runtime configuration.
//!
//! Every setting can come from the environment or from an optional TOML
//! file, with the environment taking precedence. The result is an immutable
//! [`Config`] which gets handed to each component when it is constructed.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sec::Secret;
use serde_derive::Deserialize;
use url::Url;

use crate::errors::BackupError;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct Config {
    pub general: General,
    pub github: GitHubConfig,
    pub storage: StorageConfig,
    pub notify: Option<NotifyConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct General {
    /// Where temporary workspaces get created (the system temp dir if not
    /// set).
    pub scratch_dir: Option<PathBuf>,
    /// The longest a single repository is allowed to take.
    pub timeout: Option<Duration>,
    /// Abort the whole run as soon as one repository fails.
    pub fail_fast: bool,
}

#[derive(Debug, Clone)]
pub struct GitHubConfig {
    pub credentials: Credentials,
    /// Namespace sources, e.g. `/users/alice/repos` or `/orgs/acme/repos`.
    pub sources: Vec<String>,
    pub api_url: Url,
    /// The maximum number of branch listings in flight at once.
    pub concurrency: usize,
}

/// The identity used when talking to GitHub and cloning.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub token: Secret<String>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: Secret<String>,
    /// A custom endpoint for S3-compatible stores.
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotifyConfig {
    pub ping_url: Url,
}

impl Config {
    /// Load the config from the file at `path` (if there is one), letting
    /// anything found by `env` override it.
    ///
    /// When `must_exist` is `false` a missing file is treated as empty.
    pub fn load<F>(path: &Path, must_exist: bool, env: F) -> Result<Config, BackupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let src = match fs::read_to_string(path) {
            Ok(src) => src,
            Err(ref e) if !must_exist && e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config file at {}", path.display());
                String::new()
            }
            Err(e) => {
                return Err(BackupError::InvalidConfig {
                    key: "--config",
                    reason: format!("unable to read {}: {}", path.display(), e),
                })
            }
        };

        Config::from_toml(&src, env)
    }

    /// Build a config purely from environment variables.
    pub fn from_env<F>(env: F) -> Result<Config, BackupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Config::from_toml("", env)
    }

    pub fn from_toml<F>(src: &str, env: F) -> Result<Config, BackupError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file: FileConfig = toml::from_str(src).map_err(|e| BackupError::InvalidConfig {
            key: "--config",
            reason: e.to_string(),
        })?;

        Layers { env: &env }.resolve(file)
    }

    /// An example config file.
    pub fn example() -> &'static str {
        EXAMPLE_CONFIG
    }
}

/// The settings read from the environment.
pub mod keys {
    pub const GITHUB_USERNAME: &str = "GITHUB_USERNAME";
    pub const GITHUB_ACCESS_TOKEN: &str = "GITHUB_ACCESS_TOKEN";
    pub const GITHUB_SOURCES: &str = "GITHUB_SOURCES";
    pub const GITHUB_API_URL: &str = "GITHUB_API_URL";
    pub const AWS_REGION: &str = "AWS_REGION";
    pub const AWS_BUCKET: &str = "AWS_BUCKET";
    pub const AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
    pub const AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
    pub const AWS_ENDPOINT: &str = "AWS_ENDPOINT";
    pub const PING_URL: &str = "PING_URL";
    pub const BACKUP_SCRATCH_DIR: &str = "BACKUP_SCRATCH_DIR";
    pub const BACKUP_TIMEOUT_SECS: &str = "BACKUP_TIMEOUT_SECS";
}

struct Layers<'a, F> {
    env: &'a F,
}

impl<'a, F> Layers<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &'static str, from_file: Option<String>) -> Option<String> {
        (self.env)(key)
            .filter(|value| !value.is_empty())
            .or_else(|| from_file.filter(|value| !value.is_empty()))
    }

    fn required(&self, key: &'static str, from_file: Option<String>) -> Result<String, BackupError> {
        self.optional(key, from_file)
            .ok_or(BackupError::ConfigMissing { key })
    }

    fn resolve(&self, file: FileConfig) -> Result<Config, BackupError> {
        use self::keys::*;

        let FileConfig {
            general,
            github,
            storage,
            notify,
        } = file;

        let username = self.required(GITHUB_USERNAME, github.username)?;
        let token = self.required(
            GITHUB_ACCESS_TOKEN,
            github.access_token.map(|tok| tok.reveal().clone()),
        )?;

        let sources = match (self.env)(GITHUB_SOURCES) {
            Some(raw) => split_sources(&raw),
            None => github.sources.unwrap_or_default(),
        };
        let sources = if sources.is_empty() {
            vec![format!("/users/{}/repos", username)]
        } else {
            sources
        };

        let api_url = self
            .optional(GITHUB_API_URL, github.api_url)
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let api_url = parse_url(GITHUB_API_URL, &api_url)?;

        let github = GitHubConfig {
            credentials: Credentials {
                username,
                token: Secret::new(token),
            },
            sources,
            api_url,
            concurrency: github.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1),
        };

        let storage = StorageConfig {
            region: self.required(AWS_REGION, storage.region)?,
            bucket: self.required(AWS_BUCKET, storage.bucket)?,
            access_key_id: self.required(AWS_ACCESS_KEY_ID, storage.access_key_id)?,
            secret_access_key: Secret::new(self.required(
                AWS_SECRET_ACCESS_KEY,
                storage.secret_access_key.map(|key| key.reveal().clone()),
            )?),
            endpoint: self.optional(AWS_ENDPOINT, storage.endpoint),
        };

        let notify = match self.optional(PING_URL, notify.ping_url) {
            Some(url) => Some(NotifyConfig {
                ping_url: parse_url(PING_URL, &url)?,
            }),
            None => None,
        };

        let timeout = match (self.env)(BACKUP_TIMEOUT_SECS).filter(|v| !v.is_empty()) {
            Some(raw) => Some(raw.trim().parse::<u64>().map_err(|e| {
                BackupError::InvalidConfig {
                    key: BACKUP_TIMEOUT_SECS,
                    reason: e.to_string(),
                }
            })?),
            None => general.timeout_secs,
        };

        let general = General {
            scratch_dir: self
                .optional(
                    BACKUP_SCRATCH_DIR,
                    general.scratch_dir.map(|p| p.display().to_string()),
                )
                .map(PathBuf::from),
            timeout: timeout.filter(|&secs| secs > 0).map(Duration::from_secs),
            fail_fast: general.fail_fast,
        };

        Ok(Config {
            general,
            github,
            storage,
            notify,
        })
    }
}

fn split_sources(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_url(key: &'static str, raw: &str) -> Result<Url, BackupError> {
    Url::parse(raw).map_err(|e| BackupError::InvalidConfig {
        key,
        reason: format!("\"{}\" is not a valid URL ({})", raw, e),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    general: FileGeneral,
    github: FileGitHub,
    storage: FileStorage,
    notify: FileNotify,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
struct FileGeneral {
    scratch_dir: Option<PathBuf>,
    timeout_secs: Option<u64>,
    fail_fast: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
struct FileGitHub {
    username: Option<String>,
    access_token: Option<Secret<String>>,
    sources: Option<Vec<String>>,
    api_url: Option<String>,
    concurrency: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
struct FileStorage {
    region: Option<String>,
    bucket: Option<String>,
    access_key_id: Option<String>,
    secret_access_key: Option<Secret<String>>,
    endpoint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
struct FileNotify {
    ping_url: Option<String>,
}

const EXAMPLE_CONFIG: &str = r#"# Every value here can also be set through the environment variable named
# in the comment next to it. The environment always wins.

[github]
username = "alice"                    # GITHUB_USERNAME
access-token = "ghp_XXXXXXXXXXXX"     # GITHUB_ACCESS_TOKEN
sources = [                           # GITHUB_SOURCES (comma separated)
    "/users/alice/repos",
    "/orgs/acme/repos",
]
# api-url = "https://api.github.com"  # GITHUB_API_URL
concurrency = 4

[storage]
region = "us-east-1"                  # AWS_REGION
bucket = "my-repo-backups"            # AWS_BUCKET
access-key-id = "AKIAXXXXXXXXXXXX"    # AWS_ACCESS_KEY_ID
secret-access-key = "XXXXXXXXXXXX"    # AWS_SECRET_ACCESS_KEY
# endpoint = "https://minio.local"    # AWS_ENDPOINT

[general]
# scratch-dir = "/var/tmp"            # BACKUP_SCRATCH_DIR
# timeout-secs = 1800                 # BACKUP_TIMEOUT_SECS
fail-fast = false

[notify]
# ping-url = "https://hc-ping.com/your-uuid-here"  # PING_URL
"#;
