use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::process::Command;
use url::Url;

use crate::config::Credentials;
use crate::errors::BackupError;

/// The version control operations needed to turn a remote repository into a
/// single bundle file.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Make a bare mirror of every ref in the repository at `url`.
    async fn clone_mirror(&self, url: &Url, dest: &Path, credentials: &Credentials) -> Result<(), BackupError>;

    /// Pack every ref in the repository at `repo_dir` into `bundle`.
    async fn create_bundle(&self, repo_dir: &Path, bundle: &Path) -> Result<(), BackupError>;
}

/// Shells out to the `git` command-line tool.
#[derive(Debug, Clone, PartialEq)]
pub struct GitCli {
    program: PathBuf,
}

impl GitCli {
    pub fn new<P: Into<PathBuf>>(program: P) -> GitCli {
        GitCli {
            program: program.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.env("GIT_TERMINAL_PROMPT", "0").kill_on_drop(true);
        cmd
    }
}

impl Default for GitCli {
    fn default() -> GitCli {
        GitCli::new("git")
    }
}

#[async_trait]
impl Vcs for GitCli {
    async fn clone_mirror(&self, url: &Url, dest: &Path, credentials: &Credentials) -> Result<(), BackupError> {
        debug!("Cloning {} into {}", url, dest.display());

        let mut cmd = self.command();
        cmd.arg("clone")
            .arg("--mirror")
            .arg("--quiet")
            .arg(url.as_str())
            .arg(dest)
            .envs(auth_env(credentials));

        let output = run(cmd).await.map_err(|e| BackupError::Clone {
            repo: url.to_string(),
            stderr: format!("Unable to invoke git: {}", e),
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(BackupError::Clone {
                repo: url.to_string(),
                stderr: error_message(&output),
            })
        }
    }

    async fn create_bundle(&self, repo_dir: &Path, bundle: &Path) -> Result<(), BackupError> {
        debug!("Bundling {} into {}", repo_dir.display(), bundle.display());

        let mut cmd = self.command();
        cmd.arg("bundle")
            .arg("create")
            .arg(bundle)
            .arg("--all")
            .current_dir(repo_dir);

        let output = run(cmd).await.map_err(|e| BackupError::Bundle {
            repo: repo_dir.display().to_string(),
            stderr: format!("Unable to invoke git: {}", e),
        })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(BackupError::Bundle {
                repo: repo_dir.display().to_string(),
                stderr: error_message(&output),
            })
        }
    }
}

async fn run(mut cmd: Command) -> std::io::Result<Output> {
    let output = cmd.output().await?;

    trace!("Exit Status: {}", output.status);
    if !output.stdout.is_empty() {
        trace!("Stdout: {:?}", String::from_utf8_lossy(&output.stdout));
    }

    Ok(output)
}

/// Environment variables which make `git` send our credentials with every
/// HTTP request, without them ever showing up in the process's arguments or
/// on disk.
fn auth_env(credentials: &Credentials) -> Vec<(&'static OsStr, String)> {
    let basic = STANDARD.encode(format!(
        "{}:{}",
        credentials.username,
        credentials.token.reveal()
    ));

    vec![
        (OsStr::new("GIT_CONFIG_COUNT"), String::from("1")),
        (OsStr::new("GIT_CONFIG_KEY_0"), String::from("http.extraHeader")),
        (
            OsStr::new("GIT_CONFIG_VALUE_0"),
            format!("Authorization: Basic {}", basic),
        ),
    ]
}

fn error_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();

    if !stderr.is_empty() {
        return stderr.to_string();
    }

    match output.status.code() {
        Some(ret) => format!("git exited with return code {}", ret),
        None => String::from("git was killed by a signal"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use sec::Secret;
    use std::fs;
    use std::process::Stdio;

    macro_rules! require_program {
        ($name:expr) => {{
            let exists = ::std::process::Command::new($name)
                .arg("--help")
                .stdout(::std::process::Stdio::null())
                .stderr(::std::process::Stdio::null())
                .status()
                .is_ok();
            if !exists {
                eprintln!("Couldn't find \"{}\"", $name);
                return;
            }
        }};
    }

    fn credentials() -> Credentials {
        Credentials {
            username: String::from("alice"),
            token: Secret::new(String::from("ghp_secret")),
        }
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(&["-c", "user.name=Test", "-c", "user.email=test@example.com"])
            .args(args)
            .current_dir(dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {:?} failed", args);
    }

    /// Create a repository with a couple of branches to clone from.
    pub(crate) fn upstream_repo(dir: &Path) {
        fs::create_dir_all(dir).unwrap();
        git(dir, &["init", "--quiet"]);
        git(dir, &["commit", "--quiet", "--allow-empty", "-m", "Initial commit"]);
        git(dir, &["branch", "feature"]);
    }

    #[test]
    fn credentials_go_in_an_auth_header() {
        let env = auth_env(&credentials());

        let value = &env
            .iter()
            .find(|(key, _)| *key == OsStr::new("GIT_CONFIG_VALUE_0"))
            .unwrap()
            .1;
        let encoded = value.trim_start_matches("Authorization: Basic ");
        let decoded = STANDARD.decode(encoded).unwrap();
        assert_eq!(decoded, b"alice:ghp_secret");
    }

    #[tokio::test]
    async fn clone_and_bundle_a_repo() {
        require_program!("git");

        let temp = tempfile::tempdir().unwrap();
        let upstream = temp.path().join("upstream");
        upstream_repo(&upstream);
        let url = Url::from_directory_path(&upstream).unwrap();
        let mirror = temp.path().join("mirror");
        let bundle = temp.path().join("out.bundle");
        let git = GitCli::default();

        git.clone_mirror(&url, &mirror, &credentials()).await.unwrap();
        assert!(mirror.join("HEAD").exists(), "mirrors are bare");

        git.create_bundle(&mirror, &bundle).await.unwrap();
        let header = fs::read(&bundle).unwrap();
        assert!(header.starts_with(b"# v"), "not a git bundle");
    }

    #[tokio::test]
    async fn cloning_a_missing_repo_is_a_clone_error() {
        require_program!("git");

        let temp = tempfile::tempdir().unwrap();
        let url = Url::from_directory_path(temp.path().join("missing")).unwrap();

        let err = GitCli::default()
            .clone_mirror(&url, &temp.path().join("dest"), &credentials())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Clone);
    }

    #[tokio::test]
    async fn bundling_something_thats_not_a_repo_is_a_bundle_error() {
        require_program!("git");

        let temp = tempfile::tempdir().unwrap();
        let not_a_repo = temp.path().join("plain");
        fs::create_dir(&not_a_repo).unwrap();

        let err = GitCli::default()
            .create_bundle(&not_a_repo, &temp.path().join("out.bundle"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Bundle);
    }

    #[tokio::test]
    async fn a_missing_git_binary_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let git = GitCli::new(temp.path().join("definitely-not-git"));
        let url = Url::parse("https://github.com/alice/demo.git").unwrap();

        let err = git
            .clone_mirror(&url, &temp.path().join("dest"), &credentials())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Clone);
        assert!(err.to_string().contains("Unable to invoke git"));
    }
}
