//! Fallback chain for getting a post's media onto disk.
//!
//! Strategies, first non-empty result wins:
//!
//! 1. the post URL as-is
//! 2. the URL after following redirects, query stripped
//! 3. each Wayback Machine capture of the URL, oldest first
//! 4. the platform's cached preview, for single-image posts

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use super::classify::{Classifier, MediaType, SourceTables};
use super::gallery::download_gallery;
use super::image::download_image;
use super::text::write_text;
use super::ytdlp::{VideoEngine, VideoFetcher};
use super::FetchError;
use crate::config::Config;
use crate::constants::DEAD_LINK_TARGETS;
use crate::http::{HttpClient, RequestOptions};
use crate::posts::Post;
use crate::wayback::WaybackClient;

#[derive(Clone)]
pub struct Downloader {
    http: HttpClient,
    classifier: Classifier,
    wayback: WaybackClient,
    video: VideoFetcher,
    redirect_timeout: Duration,
    dead_link_targets: Vec<String>,
}

impl Downloader {
    #[must_use]
    pub fn new(
        http: HttpClient,
        classifier: Classifier,
        wayback: WaybackClient,
        video: VideoFetcher,
        redirect_timeout: Duration,
    ) -> Self {
        Self {
            http,
            classifier,
            wayback,
            video,
            redirect_timeout,
            dead_link_targets: DEAD_LINK_TARGETS.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// Wire up a downloader from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the sources
    /// file cannot be loaded.
    pub fn from_config(config: &Config, engine: Arc<dyn VideoEngine>) -> Result<Self> {
        let http = HttpClient::new(config.http_settings()).context("Failed to build HTTP client")?;
        let tables = config.source_tables()?;
        let classifier = Classifier::new(http.clone(), tables);
        let wayback = WaybackClient::new(
            http.clone(),
            config.wayback_cdx_url.clone(),
            config.wayback_snapshot_base.clone(),
            config.wayback_max_snapshots,
        );
        let video = VideoFetcher::new(
            engine,
            config.video_max_tries,
            config.archive_cooldown,
            http.settings().archive_host.clone(),
        );
        Ok(Self::new(http, classifier, wayback, video, config.redirect_timeout))
    }

    /// Replace the redirect targets that mark a link as dead.
    #[must_use]
    pub fn with_dead_link_targets(mut self, targets: Vec<String>) -> Self {
        self.dead_link_targets = targets;
        self
    }

    #[must_use]
    pub fn tables(&self) -> &SourceTables {
        self.classifier.tables()
    }

    /// Download `post` to files named after `target`.
    ///
    /// An empty list means every strategy came up empty.
    ///
    /// # Errors
    ///
    /// Only filesystem failures and an unusable video engine are errors.
    pub async fn download(&self, post: &Post, target: &Path) -> Result<Vec<PathBuf>, FetchError> {
        if let Some(url) = post.url.as_deref() {
            debug!(post_id = %post.id, url = %url, "Attempting regular download");
            let files = self.attempt(post, url, target).await?;
            if !files.is_empty() {
                return Ok(files);
            }

            let resolved = self.resolve_redirects(url).await;
            if resolved != url {
                debug!(post_id = %post.id, url = %resolved, "Attempting download from redirected URL");
                let files = self.attempt(post, &resolved, target).await?;
                if !files.is_empty() {
                    return Ok(files);
                }
            }

            debug!(post_id = %post.id, "Attempting download from Wayback Machine");
            match self.wayback.list_snapshots(url).await {
                Ok(mut candidates) => {
                    if candidates.is_empty() {
                        debug!(post_id = %post.id, "No Wayback Machine captures found");
                    }
                    let mut count = 0;
                    while let Some(snapshot) = candidates.next(&self.http).await {
                        count += 1;
                        debug!(
                            post_id = %post.id,
                            attempt = count,
                            remaining = candidates.remaining(),
                            url = %snapshot,
                            "Attempting Wayback Machine download"
                        );
                        let files = self.attempt(post, &snapshot, target).await?;
                        if !files.is_empty() {
                            return Ok(files);
                        }
                    }
                }
                Err(e) => debug!(post_id = %post.id, error = %e, "Wayback Machine lookup failed"),
            }
        }

        if let Some(preview) = post.url_preview.as_deref() {
            if self.tables().is_image_source(post.source.as_deref()) && post.data.len() <= 1 {
                debug!(post_id = %post.id, url = %preview, "Attempting cached preview image");
                let files = self.attempt(post, preview, target).await?;
                if !files.is_empty() {
                    return Ok(files);
                }
            }
        }

        Ok(Vec::new())
    }

    /// Follow redirects from `url` and return where they end, without query.
    ///
    /// Any failure, including an error status, gives back `url` unchanged.
    pub async fn resolve_redirects(&self, url: &str) -> String {
        let options = RequestOptions::new()
            .max_tries(1)
            .timeout(self.redirect_timeout);

        match self.http.head_with(url, &options).await {
            Ok(response) if response.status().is_success() => {
                let mut resolved = response.url().clone();
                resolved.set_query(None);
                resolved.set_fragment(None);
                resolved.into()
            }
            Ok(response) => {
                debug!(url = %url, status = %response.status(), "Redirect resolution got an error status");
                url.to_string()
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Redirect resolution failed");
                url.to_string()
            }
        }
    }

    /// One strategy attempt: classify `url` and run the matching fetcher.
    async fn attempt(&self, post: &Post, url: &str, target: &Path) -> Result<Vec<PathBuf>, FetchError> {
        // Imgur swaps deleted images for a placeholder instead of a 404.
        let resolved = self.resolve_redirects(url).await;
        if self.dead_link_targets.iter().any(|dead| *dead == resolved) {
            debug!(post_id = %post.id, url = %url, "Dead link");
            return Ok(Vec::new());
        }

        let media = match self.classifier.classify(post, url).await {
            Ok(media) => media,
            Err(e) => {
                debug!(post_id = %post.id, url = %url, error = %e, "Classification failed");
                return Ok(Vec::new());
            }
        };

        let result = match media {
            MediaType::Image => download_image(&self.http, url, target)
                .await
                .map(|path| path.into_iter().collect()),
            MediaType::Gallery => download_gallery(&self.http, &post.data, target).await,
            MediaType::Video => self
                .video
                .fetch(url, target)
                .await
                .map(|path| path.into_iter().collect()),
            MediaType::Text => write_text(&post.data, target).await.map(|path| vec![path]),
            MediaType::Unknown => Ok(Vec::new()),
        };

        match result {
            Err(FetchError::Http(e)) => {
                debug!(post_id = %post.id, url = %url, media_type = %media, error = %e, "Fetch failed");
                Ok(Vec::new())
            }
            other => other,
        }
    }
}
