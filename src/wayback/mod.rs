//! Wayback Machine snapshot lookup.
//!
//! Snapshots are listed through the CDX index and handed out as a work queue.
//! Archived HTML wrapper pages are probed for embedded `<source src>` media,
//! which is queued ahead of the remaining snapshots.

use std::collections::VecDeque;

use scraper::{Html, Selector};
use tracing::{debug, info};
use url::Url;

use crate::archiver::classify::{content_type_of, media_type_from_content_type, MediaType};
use crate::http::{HttpClient, HttpError, RequestOptions};

/// CDX index client.
#[derive(Debug, Clone)]
pub struct WaybackClient {
    http: HttpClient,
    cdx_url: String,
    snapshot_base: String,
    /// Keep at most this many captures, earliest first. Zero keeps all.
    max_snapshots: usize,
}

impl WaybackClient {
    #[must_use]
    pub fn new(
        http: HttpClient,
        cdx_url: impl Into<String>,
        snapshot_base: impl Into<String>,
        max_snapshots: usize,
    ) -> Self {
        Self {
            http,
            cdx_url: cdx_url.into(),
            snapshot_base: snapshot_base.into().trim_end_matches('/').to_string(),
            max_snapshots,
        }
    }

    /// List archived captures of `url`, oldest first.
    ///
    /// An index with nothing for `url`, or an answer that can't be read,
    /// gives an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error only when the index cannot be reached at all.
    pub async fn list_snapshots(&self, url: &str) -> Result<SnapshotCandidates, HttpError> {
        debug!(url = %url, "Looking up Wayback snapshots");

        let options = RequestOptions::new()
            .query("url", url)
            .query("output", "json")
            .query("fl", "timestamp,statuscode")
            .query("collapse", "digest");
        let response = self.http.get_with(&self.cdx_url, &options).await?;

        if !response.status().is_success() {
            debug!(url = %url, status = %response.status(), "Snapshot index returned an error");
            return Ok(SnapshotCandidates::default());
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                debug!(url = %url, error = %e, "Failed to read snapshot index response");
                return Ok(SnapshotCandidates::default());
            }
        };

        let timestamps = parse_cdx_rows(&body, self.max_snapshots);
        let urls: Vec<String> = timestamps
            .iter()
            .map(|ts| format!("{}/{ts}/{url}", self.snapshot_base))
            .collect();

        info!(url = %url, count = urls.len(), "Found Wayback snapshots");
        Ok(SnapshotCandidates::new(urls))
    }
}

/// Timestamps of usable captures in a CDX JSON answer, sorted and capped.
fn parse_cdx_rows(body: &str, max_snapshots: usize) -> Vec<String> {
    if body.trim().is_empty() {
        return Vec::new();
    }
    let rows: Vec<Vec<String>> = match serde_json::from_str(body) {
        Ok(rows) => rows,
        Err(e) => {
            debug!(error = %e, "Unparsable snapshot index response");
            return Vec::new();
        }
    };

    // First row is the field header.
    let mut captures: Vec<(String, String)> = rows
        .into_iter()
        .skip(1)
        .filter_map(|row| {
            let mut fields = row.into_iter();
            Some((fields.next()?, fields.next()?))
        })
        .filter(|(_, status)| !status.is_empty() && status.bytes().all(|b| b.is_ascii_digit()))
        .collect();

    captures.sort_by(|a, b| a.0.cmp(&b.0));
    if max_snapshots > 0 {
        captures.truncate(max_snapshots);
    }
    captures.into_iter().map(|(ts, _)| ts).collect()
}

/// Snapshot URLs still to try, with media discovered in archived pages
/// queued in front.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCandidates {
    captures: Vec<String>,
    queue: VecDeque<String>,
}

impl SnapshotCandidates {
    #[must_use]
    pub fn new(captures: Vec<String>) -> Self {
        Self {
            queue: captures.iter().cloned().collect(),
            captures,
        }
    }

    /// Take the next candidate URL.
    ///
    /// The candidate is fetched first; when it is not direct media, any
    /// `<source src>` URLs in the page become the next candidates. The
    /// candidate itself is returned either way.
    pub async fn next(&mut self, http: &HttpClient) -> Option<String> {
        let url = self.queue.pop_front()?;

        match http.get(&url).await {
            Ok(response) => {
                let media = content_type_of(&response)
                    .map_or(MediaType::Unknown, media_type_from_content_type);
                if media == MediaType::Unknown {
                    match response.text().await {
                        Ok(body) => {
                            let sources = extract_sources(&body, &url);
                            if !sources.is_empty() {
                                debug!(url = %url, count = sources.len(), "Found embedded media in snapshot");
                            }
                            for source in sources.into_iter().rev() {
                                self.queue.push_front(source);
                            }
                        }
                        Err(e) => debug!(url = %url, error = %e, "Failed to read snapshot body"),
                    }
                }
            }
            Err(e) => debug!(url = %url, error = %e, "Snapshot probe failed"),
        }

        Some(url)
    }

    /// Start over from the original captures.
    pub fn restart(&mut self) {
        self.queue = self.captures.iter().cloned().collect();
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Absolute URLs of `<source src>` elements, in document order.
fn extract_sources(body: &str, page_url: &str) -> Vec<String> {
    let Ok(selector) = Selector::parse("source[src]") else {
        return Vec::new();
    };
    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(body);

    document
        .select(&selector)
        .filter_map(|element| element.value().attr("src"))
        .map(str::trim)
        .filter(|src| !src.is_empty())
        .filter_map(|src| match &base {
            Some(base) => base.join(src).ok().map(String::from),
            None => Url::parse(src).ok().map(String::from),
        })
        .collect()
}
