//! GitHub API client — tag listing, commit details, source tarballs.

use std::path::Path;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("cortex-orchestrator/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, thiserror::Error)]
pub enum GithubError {
    #[error("not found on GitHub: {0}")]
    NotFound(String),
    #[error("GitHub API rate limit exceeded")]
    RateLimited,
    #[error("GitHub API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("GitHub request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("failed to write snapshot: {0}")]
    Io(#[from] std::io::Error),
}

/// A repository tag with its commit reference.
#[derive(Debug, Clone, Serialize)]
pub struct TagInfo {
    pub name: String,
    pub commit: CommitRef,
    pub zipball_url: String,
    pub tarball_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitRef {
    pub sha: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Commit metadata from `GET /repos/{repo}/commits/{sha}`.
#[derive(Debug, Clone, Serialize)]
pub struct CommitDetails {
    pub sha: String,
    pub message: String,
    pub author: String,
    pub date: String,
    pub html_url: String,
}

// Raw GitHub response shapes, mapped down to the types above.

#[derive(Debug, Deserialize)]
struct RawTag {
    name: String,
    commit: RawTagCommit,
    zipball_url: String,
    tarball_url: String,
}

#[derive(Debug, Deserialize)]
struct RawTagCommit {
    sha: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct RawCommit {
    sha: String,
    html_url: String,
    commit: RawCommitBody,
}

#[derive(Debug, Deserialize)]
struct RawCommitBody {
    message: String,
    author: RawCommitAuthor,
}

#[derive(Debug, Deserialize)]
struct RawCommitAuthor {
    name: String,
    date: String,
}

/// Client for the GitHub REST API.
///
/// The token is optional: without one, only public repositories are
/// reachable and the anonymous rate limit applies.
#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .get(url)
            .header("Accept", "application/vnd.github.v3+json")
            .header("User-Agent", USER_AGENT);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("token {token}"));
        }
        req
    }

    /// List tags for a repository (`owner/repo`), newest first per GitHub.
    pub async fn list_tags(&self, repo: &str) -> Result<Vec<TagInfo>, GithubError> {
        crate::metrics::github_request("tags");
        let url = format!("{API_BASE}/repos/{repo}/tags");
        let resp = self.get(&url).send().await?;
        let resp = check_response(resp, repo).await?;

        let raw: Vec<RawTag> = resp.json().await?;
        Ok(raw.into_iter().map(tag_from_raw).collect())
    }

    /// Fetch commit metadata for one SHA.
    pub async fn get_commit(&self, repo: &str, sha: &str) -> Result<CommitDetails, GithubError> {
        crate::metrics::github_request("commit");
        let url = format!("{API_BASE}/repos/{repo}/commits/{sha}");
        let resp = self.get(&url).send().await?;
        let resp = check_response(resp, &format!("{repo}@{sha}")).await?;

        let raw: RawCommit = resp.json().await?;
        Ok(commit_from_raw(raw))
    }

    /// Download the source tarball for a ref (tag, branch, or SHA) to `dest`.
    pub async fn download_tarball(
        &self,
        repo: &str,
        git_ref: &str,
        dest: &Path,
    ) -> Result<(), GithubError> {
        crate::metrics::github_request("tarball");
        let url = format!("{API_BASE}/repos/{repo}/tarball/{git_ref}");
        let resp = self.get(&url).send().await?;
        let resp = check_response(resp, &format!("{repo}@{git_ref}")).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        tracing::info!(repo, git_ref, dest = %dest.display(), "Downloaded snapshot");
        Ok(())
    }
}

/// Map a non-success response to the error taxonomy.
async fn check_response(
    resp: reqwest::Response,
    what: &str,
) -> Result<reqwest::Response, GithubError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(GithubError::NotFound(what.to_string()));
    }
    let exhausted = resp
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        == Some("0");
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || (status == reqwest::StatusCode::FORBIDDEN && exhausted)
    {
        return Err(GithubError::RateLimited);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(GithubError::Api {
        status: status.as_u16(),
        body,
    })
}

fn tag_from_raw(raw: RawTag) -> TagInfo {
    TagInfo {
        name: raw.name,
        commit: CommitRef {
            sha: raw.commit.sha,
            url: raw.commit.url,
            date: None,
            author: None,
            message: None,
        },
        zipball_url: raw.zipball_url,
        tarball_url: raw.tarball_url,
    }
}

fn commit_from_raw(raw: RawCommit) -> CommitDetails {
    CommitDetails {
        sha: raw.sha,
        message: raw.commit.message,
        author: raw.commit.author.name,
        date: raw.commit.author.date,
        html_url: raw.html_url,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAGS_FIXTURE: &str = r#"[
        {
            "name": "v1.2.3",
            "commit": {
                "sha": "c5b97d5ae6c19d5c5df71a34c7fbeeda2479ccbc",
                "url": "https://api.github.com/repos/habitio/bre-cortex/commits/c5b97d5ae6c19d5c5df71a34c7fbeeda2479ccbc"
            },
            "zipball_url": "https://api.github.com/repos/habitio/bre-cortex/zipball/v1.2.3",
            "tarball_url": "https://api.github.com/repos/habitio/bre-cortex/tarball/v1.2.3",
            "node_id": "MDM6UmVmNjI3OnYxLjIuMw=="
        },
        {
            "name": "v1.2.2",
            "commit": {
                "sha": "9fd1a60e1ec7d1c5cf71a34c7fbeeda2479ccbca",
                "url": "https://api.github.com/repos/habitio/bre-cortex/commits/9fd1a60e1ec7d1c5cf71a34c7fbeeda2479ccbca"
            },
            "zipball_url": "https://api.github.com/repos/habitio/bre-cortex/zipball/v1.2.2",
            "tarball_url": "https://api.github.com/repos/habitio/bre-cortex/tarball/v1.2.2"
        }
    ]"#;

    const COMMIT_FIXTURE: &str = r#"{
        "sha": "c5b97d5ae6c19d5c5df71a34c7fbeeda2479ccbc",
        "html_url": "https://github.com/habitio/bre-cortex/commit/c5b97d5ae6c19d5c5df71a34c7fbeeda2479ccbc",
        "commit": {
            "message": "Release v1.2.3\n\nPayment rule fixes.",
            "author": {
                "name": "Jane Dev",
                "email": "jane@habit.io",
                "date": "2024-11-02T10:15:30Z"
            }
        },
        "stats": { "total": 12, "additions": 8, "deletions": 4 }
    }"#;

    #[test]
    fn parses_tag_listing() {
        let raw: Vec<RawTag> = serde_json::from_str(TAGS_FIXTURE).unwrap();
        let tags: Vec<TagInfo> = raw.into_iter().map(tag_from_raw).collect();

        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].name, "v1.2.3");
        assert_eq!(tags[0].commit.sha, "c5b97d5ae6c19d5c5df71a34c7fbeeda2479ccbc");
        assert!(tags[0].tarball_url.ends_with("/tarball/v1.2.3"));
        assert!(tags[0].commit.author.is_none());
    }

    #[test]
    fn parses_commit_details() {
        let raw: RawCommit = serde_json::from_str(COMMIT_FIXTURE).unwrap();
        let commit = commit_from_raw(raw);

        assert_eq!(commit.author, "Jane Dev");
        assert_eq!(commit.date, "2024-11-02T10:15:30Z");
        assert!(commit.message.starts_with("Release v1.2.3"));
        assert!(commit.html_url.contains("/commit/"));
    }

    #[test]
    fn enriched_fields_are_omitted_when_absent() {
        let tag = TagInfo {
            name: "v1.0.0".to_string(),
            commit: CommitRef {
                sha: "abc".to_string(),
                url: "u".to_string(),
                date: None,
                author: None,
                message: None,
            },
            zipball_url: "z".to_string(),
            tarball_url: "t".to_string(),
        };
        let json = serde_json::to_value(&tag).unwrap();
        assert!(json["commit"].get("author").is_none());
        assert!(json["commit"].get("date").is_none());
    }
}
