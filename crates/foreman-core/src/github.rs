use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::PublishError;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Pull request as returned by the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenedRequest {
    pub number: i64,
    pub html_url: String,
}

/// A version-control host that can open pull requests.
#[async_trait]
pub trait PullRequestHost: Send + Sync {
    async fn open_pull_request(
        &self,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<OpenedRequest, PublishError>;
}

/// GitHub REST v3 client for one repository.
pub struct GitHub {
    http: reqwest::Client,
    api_url: String,
    repo: String,
    token: String,
}

impl GitHub {
    /// `None` unless both a token and an `owner/name` repo are configured.
    pub fn from_credentials(
        api_url: &str,
        repo: &str,
        token: &str,
    ) -> Result<Option<Self>, PublishError> {
        if token.is_empty() || repo.is_empty() {
            return Ok(None);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Some(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
        }))
    }
}

#[async_trait]
impl PullRequestHost for GitHub {
    async fn open_pull_request(
        &self,
        head: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<OpenedRequest, PublishError> {
        let resp = self
            .http
            .post(format!("{}/repos/{}/pulls", self.api_url, self.repo))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "foreman-worker")
            .json(&json!({ "title": title, "head": head, "base": base, "body": body }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PublishError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json::<OpenedRequest>().await?)
    }
}
