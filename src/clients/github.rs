//! GitHub REST client for pull requests and reviews.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{CreatePullRequest, MergeChecker, PrClient, PullRequest, Review, ReviewClient,
            ReviewVerdict};
use crate::retry::permanent;

const USER_AGENT: &str = "autoralph";

pub struct GitHubClient {
    http: reqwest::Client,
    token: String,
    owner: String,
    repo: String,
}

#[derive(Debug, Deserialize)]
struct PullResponse {
    number: i64,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    id: i64,
    state: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    submitted_at: Option<String>,
    user: Option<ReviewUser>,
}

#[derive(Debug, Deserialize)]
struct ReviewUser {
    login: String,
}

impl GitHubClient {
    pub fn new(token: String, owner: String, repo: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            owner,
            repo,
        }
    }

    fn api(&self, path: &str) -> String {
        format!(
            "https://api.github.com/repos/{}/{}/{}",
            self.owner, self.repo, path
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", USER_AGENT)
    }

    /// 4xx other than 429 is permanent; everything else is retryable.
    fn check_status(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_client_error() && status != reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(permanent(anyhow::anyhow!("{} failed: {}", what, status)));
        }
        resp.error_for_status()
            .with_context(|| format!("{} returned error status", what))
    }
}

#[async_trait]
impl PrClient for GitHubClient {
    async fn create_pull_request(&self, req: &CreatePullRequest) -> Result<PullRequest> {
        let resp = self
            .request(reqwest::Method::POST, &self.api("pulls"))
            .json(&json!({
                "title": req.title,
                "body": req.body,
                "head": req.head,
                "base": req.base,
            }))
            .send()
            .await
            .context("Failed to send create-PR request to GitHub")?;
        let resp = Self::check_status(resp, "GitHub create PR")?;
        let pull: PullResponse = resp
            .json()
            .await
            .context("Failed to parse create-PR response")?;
        Ok(PullRequest {
            number: pull.number,
            html_url: pull.html_url,
        })
    }

    async fn find_open_pull_request(
        &self,
        head: &str,
        base: &str,
    ) -> Result<Option<PullRequest>> {
        let resp = self
            .request(reqwest::Method::GET, &self.api("pulls"))
            .query(&[
                ("state", "open"),
                ("head", &format!("{}:{}", self.owner, head)),
                ("base", base),
            ])
            .send()
            .await
            .context("Failed to send PR lookup request to GitHub")?;
        let resp = Self::check_status(resp, "GitHub list PRs")?;
        let pulls: Vec<PullResponse> = resp
            .json()
            .await
            .context("Failed to parse PR lookup response")?;
        Ok(pulls.into_iter().next().map(|p| PullRequest {
            number: p.number,
            html_url: p.html_url,
        }))
    }

    async fn edit_pull_request(&self, number: i64, title: &str, body: &str) -> Result<()> {
        let resp = self
            .request(reqwest::Method::PATCH, &self.api(&format!("pulls/{number}")))
            .json(&json!({ "title": title, "body": body }))
            .send()
            .await
            .context("Failed to send edit-PR request to GitHub")?;
        Self::check_status(resp, "GitHub edit PR")?;
        Ok(())
    }
}

#[async_trait]
impl ReviewClient for GitHubClient {
    async fn list_reviews(&self, pr_number: i64) -> Result<Vec<Review>> {
        let mut reviews = Vec::new();
        let mut page = 1u32;
        loop {
            let resp = self
                .request(
                    reqwest::Method::GET,
                    &self.api(&format!("pulls/{pr_number}/reviews")),
                )
                .query(&[("per_page", "100"), ("page", &page.to_string())])
                .send()
                .await
                .context("Failed to send reviews request to GitHub")?;
            let resp = Self::check_status(resp, "GitHub list reviews")?;
            let batch: Vec<ReviewResponse> = resp
                .json()
                .await
                .context("Failed to parse reviews response")?;
            let count = batch.len();
            reviews.extend(batch.into_iter().map(|r| Review {
                id: r.id.to_string(),
                author_name: r.user.map(|u| u.login).unwrap_or_default(),
                verdict: ReviewVerdict::from_str(&r.state),
                body: r.body.unwrap_or_default(),
                submitted_at: r.submitted_at.unwrap_or_default(),
            }));
            if count < 100 {
                break;
            }
            page += 1;
        }
        Ok(reviews)
    }
}

#[async_trait]
impl MergeChecker for GitHubClient {
    async fn is_merged(&self, pr_number: i64) -> Result<bool> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &self.api(&format!("pulls/{pr_number}/merge")),
            )
            .send()
            .await
            .context("Failed to send merge-check request to GitHub")?;
        // 204: merged. 404: not merged. Anything else is an error.
        match resp.status() {
            reqwest::StatusCode::NO_CONTENT => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => anyhow::bail!("GitHub merge check failed: {}", status),
        }
    }
}
