use std::collections::HashSet;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::Client;
use serde_derive::Deserialize;
use url::Url;

use crate::config::{keys, GitHubConfig};
use crate::errors::BackupError;
use crate::fingerprint::fingerprint;
use crate::utils::paginated;
use crate::{Provider, Repo};

const PER_PAGE: &str = "100";

/// Which kind of account a [`SourceSpec`] lists repositories for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Namespace {
    User,
    Organisation,
}

impl Namespace {
    fn as_path_segment(self) -> &'static str {
        match self {
            Namespace::User => "users",
            Namespace::Organisation => "orgs",
        }
    }
}

/// A validated repository source, written as `/users/<name>/repos` or
/// `/orgs/<name>/repos`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub namespace: Namespace,
    pub name: String,
}

impl SourceSpec {
    /// Does this source list `username`'s own repositories?
    pub fn is_self(&self, username: &str) -> bool {
        self.namespace == Namespace::User && self.name.eq_ignore_ascii_case(username)
    }

    /// The listing endpoint for this source, relative to `api_url`.
    ///
    /// `/users/<name>/repos` only ever shows public repositories, so when the
    /// source names the authenticated user we ask for `/user/repos` instead,
    /// which includes their private ones.
    pub fn endpoint(&self, api_url: &Url, username: &str) -> Result<Url, BackupError> {
        let base = api_url.as_str().trim_end_matches('/');
        let raw = if self.is_self(username) {
            format!("{}/user/repos", base)
        } else {
            format!("{}{}", base, self)
        };

        let mut url = Url::parse(&raw).map_err(|e| BackupError::InvalidSourceSpec {
            source: format!("{} ({})", self, e),
        })?;
        if self.is_self(username) {
            url.query_pairs_mut().append_pair("affiliation", "owner");
        }
        url.query_pairs_mut().append_pair("per_page", PER_PAGE);

        Ok(url)
    }
}

impl FromStr for SourceSpec {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<SourceSpec, BackupError> {
        let invalid = || BackupError::InvalidSourceSpec {
            source: s.to_string(),
        };

        let segments: Vec<&str> = s.strip_prefix('/').ok_or_else(invalid)?.split('/').collect();

        let (kind, name) = match segments.as_slice() {
            [kind, name, "repos"] => (*kind, *name),
            _ => return Err(invalid()),
        };

        let namespace = match kind {
            "users" => Namespace::User,
            "orgs" => Namespace::Organisation,
            _ => return Err(invalid()),
        };

        let valid_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid_name {
            return Err(invalid());
        }

        Ok(SourceSpec {
            namespace,
            name: name.to_string(),
        })
    }
}

impl Display for SourceSpec {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "/{}/{}/repos", self.namespace.as_path_segment(), self.name)
    }
}

/// An interface to the repositories stored on GitHub.
#[derive(Clone)]
pub struct GitHub {
    client: Client,
    cfg: GitHubConfig,
}

impl GitHub {
    /// Create a new `GitHub` with the provided config.
    pub fn with_config(cfg: GitHubConfig) -> Result<GitHub, BackupError> {
        let mut auth = HeaderValue::from_str(&format!("token {}", cfg.credentials.token.reveal()))
            .map_err(|e| BackupError::InvalidConfig {
                key: keys::GITHUB_ACCESS_TOKEN,
                reason: e.to_string(),
            })?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github.v3+json"),
        );
        headers.insert(USER_AGENT, HeaderValue::from_static("bundle-backup"));
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| BackupError::InvalidConfig {
                key: keys::GITHUB_API_URL,
                reason: e.to_string(),
            })?;

        Ok(GitHub { client, cfg })
    }

    fn sources(&self) -> Result<Vec<SourceSpec>, BackupError> {
        self.cfg.sources.iter().map(|s| s.parse()).collect()
    }

    async fn list_source(&self, source: &SourceSpec) -> Result<Vec<RawRepo>, BackupError> {
        let endpoint = source.endpoint(&self.cfg.api_url, &self.cfg.credentials.username)?;

        paginated::<RawRepo>(self.client.clone(), endpoint)
            .try_collect()
            .await
            .map_err(|e| BackupError::ProviderList {
                source: source.to_string(),
                reason: e.to_string(),
            })
    }

    async fn branch_heads(&self, full_name: &str) -> Result<Vec<String>, BackupError> {
        let branch_error = |reason: String| BackupError::ProviderBranch {
            repo: full_name.to_string(),
            reason,
        };

        let raw = format!(
            "{}/repos/{}/branches",
            self.cfg.api_url.as_str().trim_end_matches('/'),
            full_name
        );
        let mut endpoint = Url::parse(&raw).map_err(|e| branch_error(e.to_string()))?;
        endpoint.query_pairs_mut().append_pair("per_page", PER_PAGE);

        let branches: Vec<RawBranch> = paginated::<RawBranch>(self.client.clone(), endpoint)
            .try_collect()
            .await
            .map_err(|e| branch_error(e.to_string()))?;

        trace!(
            "{} has branches {:?}",
            full_name,
            branches.iter().map(|b| &b.name).collect::<Vec<_>>()
        );

        Ok(branches.into_iter().map(|b| b.commit.sha).collect())
    }

    async fn describe(&self, raw: RawRepo) -> Result<Repo, BackupError> {
        let heads = self.branch_heads(&raw.full_name).await?;
        let hash = fingerprint(&raw.full_name, &heads)?;
        let clone_url = self.clone_url(&raw)?;

        debug!("{} is at {}", raw.full_name, hash);
        Ok(Repo::new(&raw.full_name, clone_url, hash))
    }

    /// The repository's clone URL with our username in it, so `git` knows
    /// who to authenticate as. The token itself is only handed over when
    /// cloning.
    fn clone_url(&self, raw: &RawRepo) -> Result<Url, BackupError> {
        let bad_url = |reason: String| BackupError::ProviderList {
            source: raw.full_name.clone(),
            reason: format!("bad clone URL \"{}\": {}", raw.clone_url, reason),
        };

        let mut url = Url::parse(&raw.clone_url).map_err(|e| bad_url(e.to_string()))?;
        url.set_username(&self.cfg.credentials.username)
            .map_err(|_| bad_url(String::from("it can't hold a username")))?;
        url.set_password(None)
            .map_err(|_| bad_url(String::from("it can't hold a password")))?;

        Ok(url)
    }
}

#[async_trait]
impl Provider for GitHub {
    fn name(&self) -> &str {
        "github"
    }

    async fn repositories(&self) -> Result<Vec<Repo>, BackupError> {
        // Reject every malformed source before touching the network
        let sources = self.sources()?;

        let mut seen = HashSet::new();
        let mut raw_repos = Vec::new();

        for source in &sources {
            info!("Fetching repositories from {}", source);
            let found = self.list_source(source).await?;
            info!("Found {} repos in {}", found.len(), source);

            for repo in found {
                if seen.insert(repo.full_name.clone()) {
                    raw_repos.push(repo);
                } else {
                    debug!("Skipping {}, it was already listed", repo.full_name);
                }
            }
        }

        stream::iter(raw_repos)
            .map(|raw| self.describe(raw))
            .buffered(self.cfg.concurrency.max(1))
            .try_collect()
            .await
    }
}

impl Debug for GitHub {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("GitHub")
            .field("api_url", &self.cfg.api_url.as_str())
            .field("sources", &self.cfg.sources)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawRepo {
    full_name: String,
    clone_url: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawBranch {
    name: String,
    commit: RawCommit,
}

#[derive(Debug, Clone, Deserialize)]
struct RawCommit {
    sha: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::errors::ErrorKind;
    use httpmock::prelude::*;
    use sec::Secret;
    use serde_json::json;
    use sha2::{Digest, Sha256};

    fn github(server: &MockServer, sources: &[&str]) -> GitHub {
        let cfg = GitHubConfig {
            credentials: Credentials {
                username: String::from("alice"),
                token: Secret::new(String::from("ghp_secret")),
            },
            sources: sources.iter().map(|s| s.to_string()).collect(),
            api_url: Url::parse(&server.base_url()).unwrap(),
            concurrency: 2,
        };

        GitHub::with_config(cfg).unwrap()
    }

    fn repo_json(full_name: &str) -> serde_json::Value {
        json!({
            "id": 1,
            "full_name": full_name,
            "clone_url": format!("https://github.com/{}.git", full_name),
            "private": false,
        })
    }

    fn branch_json(name: &str, sha: &str) -> serde_json::Value {
        json!({ "name": name, "commit": { "sha": sha, "url": "https://example.com" } })
    }

    #[test]
    fn parse_valid_sources() {
        let got: SourceSpec = "/users/alice/repos".parse().unwrap();
        assert_eq!(
            got,
            SourceSpec {
                namespace: Namespace::User,
                name: String::from("alice"),
            }
        );

        let got: SourceSpec = "/orgs/acme-corp/repos".parse().unwrap();
        assert_eq!(got.namespace, Namespace::Organisation);
        assert_eq!(got.to_string(), "/orgs/acme-corp/repos");
    }

    #[test]
    fn reject_malformed_sources() {
        let inputs = [
            "/groups/alice/repos",
            "users/alice/repos",
            "/users//repos",
            "/users/alice",
            "/users/alice/repos/extra",
            "/users/alice/starred",
            "",
        ];

        for input in inputs.iter() {
            let err = input.parse::<SourceSpec>().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidSourceSpec, "{}", input);
        }
    }

    #[test]
    fn endpoints_keep_the_api_prefix() {
        let source: SourceSpec = "/orgs/acme/repos".parse().unwrap();
        let api = Url::parse("https://github.example.com/api/v3/").unwrap();

        let got = source.endpoint(&api, "alice").unwrap();

        assert_eq!(
            got.as_str(),
            "https://github.example.com/api/v3/orgs/acme/repos?per_page=100"
        );
    }

    #[test]
    fn the_authenticated_user_gets_their_private_repos_too() {
        let api = Url::parse("https://api.github.com").unwrap();

        let own: SourceSpec = "/users/Alice/repos".parse().unwrap();
        assert_eq!(
            own.endpoint(&api, "alice").unwrap().as_str(),
            "https://api.github.com/user/repos?affiliation=owner&per_page=100"
        );

        let someone_else: SourceSpec = "/users/bob/repos".parse().unwrap();
        assert_eq!(
            someone_else.endpoint(&api, "alice").unwrap().as_str(),
            "https://api.github.com/users/bob/repos?per_page=100"
        );
    }

    #[tokio::test]
    async fn list_and_fingerprint_a_users_repos() {
        let server = MockServer::start_async().await;
        let listing = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/user/repos")
                    .query_param("affiliation", "owner")
                    .header("authorization", "token ghp_secret");
                then.status(200).json_body(json!([repo_json("alice/demo")]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/alice/demo/branches");
                then.status(200).json_body(json!([
                    branch_json("feature", "b2"),
                    branch_json("master", "a1"),
                ]));
            })
            .await;

        let repos = github(&server, &["/users/alice/repos"])
            .repositories()
            .await
            .unwrap();

        listing.assert_async().await;
        assert_eq!(repos.len(), 1);
        let repo = &repos[0];
        assert_eq!(repo.full_name, "alice/demo");
        assert_eq!(repo.backup_filename, "github_alice_demo.bundle");
        assert_eq!(repo.fingerprint, hex::encode(Sha256::digest(b"a1b2")));
    }

    #[tokio::test]
    async fn other_users_are_listed_through_their_public_endpoint() {
        let server = MockServer::start_async().await;
        let own = server
            .mock_async(|when, then| {
                when.method(GET).path("/user/repos");
                then.status(200).json_body(json!([]));
            })
            .await;
        let theirs = server
            .mock_async(|when, then| {
                when.method(GET).path("/users/bob/repos");
                then.status(200).json_body(json!([repo_json("bob/tool")]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/bob/tool/branches");
                then.status(200).json_body(json!([branch_json("master", "a1")]));
            })
            .await;

        let repos = github(&server, &["/users/bob/repos"])
            .repositories()
            .await
            .unwrap();

        theirs.assert_async().await;
        own.assert_hits_async(0).await;
        assert_eq!(repos[0].full_name, "bob/tool");
    }

    #[tokio::test]
    async fn branch_order_from_the_api_doesnt_change_the_fingerprint() {
        let mut fingerprints = Vec::new();

        for branches in [["a1", "b2"], ["b2", "a1"]].iter() {
            let server = MockServer::start_async().await;
            server
                .mock_async(|when, then| {
                    when.method(GET).path("/user/repos");
                    then.status(200).json_body(json!([repo_json("alice/demo")]));
                })
                .await;
            let body = json!([branch_json("one", branches[0]), branch_json("two", branches[1])]);
            server
                .mock_async(move |when, then| {
                    when.method(GET).path("/repos/alice/demo/branches");
                    then.status(200).json_body(body);
                })
                .await;

            let repos = github(&server, &["/users/alice/repos"])
                .repositories()
                .await
                .unwrap();
            fingerprints.push(repos[0].fingerprint.clone());
        }

        assert_eq!(fingerprints[0], fingerprints[1]);
    }

    #[tokio::test]
    async fn clone_urls_carry_the_username_but_not_the_token() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/user/repos");
                then.status(200).json_body(json!([repo_json("alice/demo")]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/alice/demo/branches");
                then.status(200).json_body(json!([branch_json("master", "a1")]));
            })
            .await;

        let repos = github(&server, &["/users/alice/repos"])
            .repositories()
            .await
            .unwrap();

        let url = &repos[0].clone_url;
        assert_eq!(url.username(), "alice");
        assert_eq!(url.password(), None);
        assert_eq!(url.as_str(), "https://alice@github.com/alice/demo.git");
        assert!(!format!("{:?}", repos[0]).contains("ghp_secret"));
    }

    #[tokio::test]
    async fn follow_pagination_links() {
        let server = MockServer::start_async().await;
        let next = format!("<{}>; rel=\"next\"", server.url("/user/repos?page=2"));
        let first = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/user/repos")
                    .query_param("per_page", "100");
                then.status(200)
                    .header("link", next.as_str())
                    .json_body(json!([repo_json("alice/one")]));
            })
            .await;
        let second = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/user/repos")
                    .query_param("page", "2");
                then.status(200).json_body(json!([repo_json("alice/two")]));
            })
            .await;
        for name in ["one", "two"].iter() {
            let path = format!("/repos/alice/{}/branches", name);
            server
                .mock_async(move |when, then| {
                    when.method(GET).path(path.as_str());
                    then.status(200).json_body(json!([branch_json("master", "a1")]));
                })
                .await;
        }

        let repos = github(&server, &["/users/alice/repos"])
            .repositories()
            .await
            .unwrap();

        first.assert_async().await;
        second.assert_async().await;
        let names: Vec<_> = repos.iter().map(|r| r.full_name.as_str()).collect();
        assert_eq!(names, vec!["alice/one", "alice/two"]);
    }

    #[tokio::test]
    async fn repos_reachable_from_two_sources_are_only_listed_once() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/user/repos");
                then.status(200).json_body(json!([repo_json("acme/tool")]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/orgs/acme/repos");
                then.status(200)
                    .json_body(json!([repo_json("acme/tool"), repo_json("acme/site")]));
            })
            .await;
        let branches = server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/acme/tool/branches");
                then.status(200).json_body(json!([branch_json("master", "a1")]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/acme/site/branches");
                then.status(200).json_body(json!([branch_json("master", "c3")]));
            })
            .await;

        let repos = github(&server, &["/users/alice/repos", "/orgs/acme/repos"])
            .repositories()
            .await
            .unwrap();

        branches.assert_hits_async(1).await;
        let names: Vec<_> = repos.iter().map(|r| r.full_name.as_str()).collect();
        assert_eq!(names, vec!["acme/tool", "acme/site"]);
    }

    #[tokio::test]
    async fn malformed_sources_fail_before_any_request() {
        let server = MockServer::start_async().await;
        let anything = server
            .mock_async(|_when, then| {
                then.status(200).json_body(json!([]));
            })
            .await;

        let err = github(&server, &["/users/alice/repos", "/groups/alice/repos"])
            .repositories()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidSourceSpec);
        anything.assert_hits_async(0).await;
    }

    #[tokio::test]
    async fn listing_failures_are_provider_list_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/orgs/acme/repos");
                then.status(404).json_body(json!({ "message": "Not Found" }));
            })
            .await;

        let err = github(&server, &["/orgs/acme/repos"])
            .repositories()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProviderList);
    }

    #[tokio::test]
    async fn branch_failures_are_provider_branch_errors() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/user/repos");
                then.status(200).json_body(json!([repo_json("alice/demo")]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/alice/demo/branches");
                then.status(500);
            })
            .await;

        let err = github(&server, &["/users/alice/repos"])
            .repositories()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ProviderBranch);
    }

    #[tokio::test]
    async fn repos_without_branches_cant_be_backed_up() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/user/repos");
                then.status(200).json_body(json!([repo_json("alice/empty")]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/repos/alice/empty/branches");
                then.status(200).json_body(json!([]));
            })
            .await;

        let err = github(&server, &["/users/alice/repos"])
            .repositories()
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::EmptyRepository);
    }
}
