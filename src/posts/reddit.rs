//! Reddit API client for saved posts.
//!
//! Uses the OAuth password grant of a "script" app, so the user supplies
//! their own client id and secret.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::csv::ensure_fullname;
use super::source::{Page, PostSource, RawPost, SourceItem};
use crate::config::Config;

/// Page size for listings; the API maximum.
const LISTING_LIMIT: &str = "100";

/// Refresh the token this long before it actually expires.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Reddit account and script-app credentials, read from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct RedditCredentials {
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub client_secret: String,
}

impl RedditCredentials {
    /// Read credentials from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or is not valid credentials JSON.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read user config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid user config: {}", path.display()))
    }
}

#[derive(Debug)]
struct AccessToken {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Listing {
    data: ListingData,
}

#[derive(Debug, Deserialize)]
struct ListingData {
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    children: Vec<Thing>,
}

#[derive(Debug, Deserialize)]
struct Thing {
    kind: String,
    data: serde_json::Value,
}

impl Thing {
    fn into_item(self) -> Option<SourceItem> {
        if self.kind == "t3" {
            return match serde_json::from_value::<RawPost>(self.data) {
                Ok(post) => Some(SourceItem::Post(Box::new(post))),
                Err(e) => {
                    warn!(error = %e, "Skipping malformed post record");
                    None
                }
            };
        }

        let id = self.data.get("id").and_then(|v| v.as_str())?.to_string();
        Some(SourceItem::Other {
            id,
            kind: self.kind,
        })
    }
}

/// Authenticated Reddit API client.
pub struct RedditClient {
    client: Client,
    credentials: RedditCredentials,
    api_base: String,
    auth_url: String,
    token: Mutex<Option<AccessToken>>,
}

impl RedditClient {
    /// Create a client. No request is made until first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &Config, credentials: RedditCredentials) -> Result<Self> {
        let user_agent = format!(
            "saved-post-archiver/{} (by u/{})",
            env!("CARGO_PKG_VERSION"),
            credentials.username
        );
        let client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(user_agent)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            credentials,
            api_base: config.reddit_api_base.trim_end_matches('/').to_string(),
            auth_url: config.reddit_auth_url.clone(),
            token: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn username(&self) -> &str {
        &self.credentials.username
    }

    /// Check that the credentials are accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication or the identity lookup fails.
    pub async fn verify_login(&self) -> Result<()> {
        let me: serde_json::Value = self.get_json("/api/v1/me", &[]).await?;
        let name = me.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        debug!(name = %name, "Reddit identity confirmed");
        Ok(())
    }

    async fn access_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_EXPIRY_MARGIN {
                return Ok(token.value.clone());
            }
        }

        debug!("Requesting Reddit access token");
        let response = self
            .client
            .post(&self.auth_url)
            .basic_auth(&self.credentials.client_id, Some(&self.credentials.client_secret))
            .form(&[
                ("grant_type", "password"),
                ("username", self.credentials.username.as_str()),
                ("password", self.credentials.password.as_str()),
            ])
            .send()
            .await
            .context("Failed to reach Reddit token endpoint")?;

        let status = response.status();
        let body: TokenResponse = response
            .json()
            .await
            .with_context(|| format!("Unexpected token response (HTTP {status})"))?;

        let Some(value) = body.access_token else {
            bail!(
                "Reddit login failed: {}",
                body.error.unwrap_or_else(|| format!("HTTP {status}"))
            );
        };

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(3600));
        *guard = Some(AccessToken {
            value: value.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let token = self.access_token().await?;
        let url = format!("{}{path}", self.api_base);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .query(&[("raw_json", "1")])
            .query(query)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {url}"))?
            .error_for_status()
            .with_context(|| format!("Reddit API error for {url}"))?;

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse response from {url}"))
    }

    async fn listing(&self, path: &str, query: &[(&str, &str)]) -> Result<Page> {
        let listing: Listing = self.get_json(path, query).await?;
        Ok(Page {
            items: listing
                .data
                .children
                .into_iter()
                .filter_map(Thing::into_item)
                .collect(),
            after: listing.data.after,
        })
    }
}

#[async_trait]
impl PostSource for RedditClient {
    async fn saved_page(&self, after: Option<&str>) -> Result<Page> {
        let path = format!("/user/{}/saved", self.credentials.username);
        let mut query = vec![("limit", LISTING_LIMIT)];
        if let Some(after) = after {
            query.push(("after", after));
        }
        self.listing(&path, &query).await
    }

    async fn info(&self, fullnames: &[String]) -> Result<Vec<SourceItem>> {
        if fullnames.is_empty() {
            return Ok(Vec::new());
        }
        let ids = fullnames.join(",");
        let page = self.listing("/api/info", &[("id", ids.as_str())]).await?;
        Ok(page.items)
    }

    async fn post(&self, id: &str) -> Result<Option<RawPost>> {
        let items = self.info(&[ensure_fullname(id)]).await?;
        Ok(items.into_iter().find_map(|item| match item {
            SourceItem::Post(post) => Some(*post),
            SourceItem::Other { .. } => None,
        }))
    }
}
