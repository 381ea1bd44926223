use std::collections::HashSet;
use std::env;
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use log::{debug, warn};
use reqwest::blocking::{Client, Response};
use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::DevkitConfig;

pub const PER_PAGE: u32 = 100;
pub const MAX_PAGES: usize = 1000;
const GITHUB_API_VERSION: &str = "2022-11-28";

/// Relations parsed from an RFC 5988 `Link` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkRelations {
    links: Vec<(String, String)>,
}

impl LinkRelations {
    pub fn get(&self, rel: &str) -> Option<&str> {
        self.links
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(rel))
            .map(|(_, url)| url.as_str())
    }

    pub fn next(&self) -> Option<&str> {
        self.get("next")
    }

    pub fn last(&self) -> Option<&str> {
        self.get("last")
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Parse `<url>; rel="next", <url>; rel="last"`. Entries without a
/// bracketed target or a `rel` parameter are skipped.
pub fn parse_link_header(value: &str) -> LinkRelations {
    let mut relations = LinkRelations::default();
    for entry in split_outside(value, ',') {
        let entry = entry.trim();
        let Some(rest) = entry.strip_prefix('<') else {
            continue;
        };
        let Some((target, params)) = rest.split_once('>') else {
            continue;
        };
        let target = target.trim();
        if target.is_empty() {
            continue;
        }
        for param in split_outside(params, ';') {
            let Some((key, raw)) = param.split_once('=') else {
                continue;
            };
            if !key.trim().eq_ignore_ascii_case("rel") {
                continue;
            }
            let names = raw.trim().trim_matches('"');
            for name in names.split_whitespace() {
                let name = name.to_ascii_lowercase();
                if relations.get(&name).is_none() {
                    relations.links.push((name, target.to_string()));
                }
            }
        }
    }
    relations
}

fn split_outside(value: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_angle = false;
    let mut in_quote = false;
    let mut start = 0usize;
    for (index, ch) in value.char_indices() {
        match ch {
            '<' if !in_quote => in_angle = true,
            '>' if !in_quote => in_angle = false,
            '"' if !in_angle => in_quote = !in_quote,
            _ if ch == separator && !in_angle && !in_quote => {
                parts.push(&value[start..index]);
                start = index + ch.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiPage {
    pub body: Value,
    pub next: Option<String>,
}

pub trait GitHubTransport {
    fn get_page(&mut self, url: &str) -> Result<ApiPage>;
}

/// Follow `next` links from `first_url`, concatenating every array page.
pub fn fetch_all<T, G>(transport: &mut G, first_url: &str) -> Result<Vec<T>>
where
    T: DeserializeOwned,
    G: GitHubTransport + ?Sized,
{
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some(first_url.to_string());

    while let Some(url) = next.take() {
        if !seen.insert(url.clone()) {
            bail!("pagination loop detected: {url} was already fetched");
        }
        if seen.len() > MAX_PAGES {
            bail!("pagination exceeded {MAX_PAGES} pages starting at {first_url}");
        }
        let page = transport.get_page(&url)?;
        let Value::Array(values) = page.body else {
            bail!("expected a JSON array from {url}");
        };
        debug!("fetched {} item(s) from {url}", values.len());
        for value in values {
            let item = serde_json::from_value(value)
                .with_context(|| format!("failed to decode item from {url}"))?;
            items.push(item);
        }
        next = page.next;
    }

    Ok(items)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ItemState {
    Open,
    #[default]
    Closed,
    All,
}

impl ItemState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
}

impl RepoRef {
    pub fn new(owner: &str, repo: &str) -> Result<Self> {
        let owner = owner.trim();
        let repo = repo.trim();
        for (label, value) in [("owner", owner), ("repository", repo)] {
            if value.is_empty() {
                bail!("GitHub {label} cannot be empty");
            }
            if value.contains('/') || value.contains(char::is_whitespace) {
                bail!("invalid GitHub {label}: {value}");
            }
        }
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }

    /// Accepts `owner/repo`.
    pub fn parse(value: &str) -> Result<Self> {
        let Some((owner, repo)) = value.trim().split_once('/') else {
            bail!("expected owner/repo, got {value}");
        };
        Self::new(owner, repo)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Milestone {
    pub number: u64,
    pub title: String,
    pub description: Option<String>,
    pub state: String,
    pub due_on: Option<String>,
    pub closed_at: Option<String>,
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct IssueUser {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct MilestoneRef {
    pub number: u64,
    pub title: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub html_url: Option<String>,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub milestone: Option<MilestoneRef>,
    pub pull_request: Option<Value>,
    pub closed_at: Option<String>,
    pub user: Option<IssueUser>,
}

impl Issue {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }

    pub fn has_label(&self, name: &str) -> bool {
        self.labels
            .iter()
            .any(|label| label.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Default)]
pub struct IssueFilter {
    pub state: ItemState,
    pub milestone: Option<u64>,
    pub labels: Vec<String>,
}

pub fn milestones_url(api_url: &str, repo: &RepoRef, state: ItemState) -> Result<String> {
    let mut url = repo_url(api_url, repo, "milestones")?;
    url.query_pairs_mut()
        .append_pair("state", state.as_str())
        .append_pair("per_page", &PER_PAGE.to_string());
    Ok(url.to_string())
}

pub fn issues_url(api_url: &str, repo: &RepoRef, filter: &IssueFilter) -> Result<String> {
    let mut url = repo_url(api_url, repo, "issues")?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("state", filter.state.as_str());
        if let Some(milestone) = filter.milestone {
            query.append_pair("milestone", &milestone.to_string());
        }
        if !filter.labels.is_empty() {
            query.append_pair("labels", &filter.labels.join(","));
        }
        query.append_pair("per_page", &PER_PAGE.to_string());
    }
    Ok(url.to_string())
}

fn repo_url(api_url: &str, repo: &RepoRef, resource: &str) -> Result<Url> {
    let mut url =
        Url::parse(api_url.trim()).with_context(|| format!("invalid GitHub API URL: {api_url}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("GitHub API URL cannot be a base: {api_url}"))?
        .pop_if_empty()
        .extend(["repos", repo.owner.as_str(), repo.repo.as_str(), resource]);
    Ok(url)
}

pub fn list_milestones<G: GitHubTransport + ?Sized>(
    transport: &mut G,
    api_url: &str,
    repo: &RepoRef,
    state: ItemState,
) -> Result<Vec<Milestone>> {
    fetch_all(transport, &milestones_url(api_url, repo, state)?)
}

/// Issues matching `filter`; pull requests returned by the issues API are dropped.
pub fn list_issues<G: GitHubTransport + ?Sized>(
    transport: &mut G,
    api_url: &str,
    repo: &RepoRef,
    filter: &IssueFilter,
) -> Result<Vec<Issue>> {
    let issues: Vec<Issue> = fetch_all(transport, &issues_url(api_url, repo, filter)?)?;
    Ok(issues
        .into_iter()
        .filter(|issue| !issue.is_pull_request())
        .collect())
}

#[derive(Debug, Clone)]
pub struct GitHubClientConfig {
    pub user_agent: String,
    pub token: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl GitHubClientConfig {
    pub fn from_config(config: &DevkitConfig) -> Self {
        Self {
            user_agent: config.user_agent(),
            token: config.github_token(),
            timeout_ms: env_value_u64("DEVKIT_HTTP_TIMEOUT_MS", 30_000),
            max_retries: env_value_usize("DEVKIT_HTTP_RETRIES", 2),
            retry_delay_ms: env_value_u64("DEVKIT_HTTP_RETRY_DELAY_MS", 500),
        }
    }
}

pub struct GitHubClient {
    client: Client,
    config: GitHubClientConfig,
    request_count: usize,
}

impl GitHubClient {
    pub fn new(config: GitHubClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build GitHub HTTP client")?;
        Ok(Self {
            client,
            config,
            request_count: 0,
        })
    }

    pub fn request_count(&self) -> usize {
        self.request_count
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl GitHubTransport for GitHubClient {
    fn get_page(&mut self, url: &str) -> Result<ApiPage> {
        for attempt in 0..=self.config.max_retries {
            let mut request = self
                .client
                .get(url)
                .header("User-Agent", self.config.user_agent.clone())
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", GITHUB_API_VERSION);
            if let Some(token) = &self.config.token {
                request = request.header("Authorization", format!("Bearer {token}"));
            }
            self.request_count += 1;

            match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let next = response
                            .headers()
                            .get("link")
                            .and_then(|value| value.to_str().ok())
                            .map(parse_link_header)
                            .and_then(|links| links.next().map(ToString::to_string));
                        let body: Value = response.json().with_context(|| {
                            format!("failed to decode GitHub response from {url}")
                        })?;
                        return Ok(ApiPage { body, next });
                    }

                    if let Some(reset) = rate_limit_reset(status, response.headers()) {
                        bail!(
                            "GitHub rate limit exhausted (HTTP {status}); resets at unix time {reset}. Set DEVKIT_GITHUB_TOKEN or GITHUB_TOKEN for a higher limit"
                        );
                    }
                    if attempt < self.config.max_retries && is_retryable_status(status) {
                        warn!("GitHub returned HTTP {status} for {url}; retrying");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    let message = error_message(response);
                    bail!("GitHub API request failed with HTTP {status}: {message}");
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        warn!("GitHub request to {url} failed ({error}); retrying");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error).with_context(|| format!("failed to call GitHub API {url}"));
                }
            }
        }

        bail!("GitHub API request exhausted retry budget")
    }
}

/// The `x-ratelimit-reset` value when a 403/429 reports no remaining quota.
fn rate_limit_reset(status: StatusCode, headers: &HeaderMap) -> Option<String> {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }
    let remaining = headers
        .get("x-ratelimit-remaining")
        .and_then(|value| value.to_str().ok())?;
    if remaining.trim() != "0" {
        return None;
    }
    Some(
        headers
            .get("x-ratelimit-reset")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown")
            .to_string(),
    )
}

fn error_message(response: Response) -> String {
    let text = response.text().unwrap_or_default();
    serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|payload| {
            payload
                .get("message")
                .and_then(Value::as_str)
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                "no response body".to_string()
            } else {
                trimmed.chars().take(200).collect()
            }
        })
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

fn env_value_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_value_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}
