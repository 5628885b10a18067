//! Upstream post records and the collaborator that supplies them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::Stream;
use serde::Deserialize;
use tracing::{debug, warn};

use super::model::Post;
use crate::archiver::classify::SourceTables;

/// Maximum number of ids per `info` lookup.
pub const INFO_BATCH_SIZE: usize = 100;

/// Crosspost chains longer than this are cut off.
const MAX_CROSSPOST_DEPTH: usize = 8;

/// A post as delivered by the platform API.
///
/// Every field the API may leave out is optional here, so absence is a
/// normal value rather than a lookup failure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPost {
    pub id: String,
    /// Fullname, e.g. `t3_abc123`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub subreddit: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub created_utc: f64,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub selftext: String,
    #[serde(default)]
    pub permalink: Option<String>,
    #[serde(default)]
    pub gallery_data: Option<GalleryData>,
    #[serde(default)]
    pub media_metadata: Option<HashMap<String, MediaMetadata>>,
    #[serde(default)]
    pub preview: Option<Preview>,
    #[serde(default)]
    pub crosspost_parent_list: Option<Vec<CrosspostRef>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GalleryData {
    #[serde(default)]
    pub items: Vec<GalleryItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GalleryItem {
    pub media_id: String,
}

/// Per-item gallery media description.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaMetadata {
    /// Mime type, e.g. `image/jpg` or `image/gif`.
    #[serde(default)]
    pub m: Option<String>,
    /// Full-size source renditions.
    #[serde(default)]
    pub s: Option<MediaSource>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaSource {
    #[serde(default)]
    pub u: Option<String>,
    #[serde(default)]
    pub gif: Option<String>,
    #[serde(default)]
    pub mp4: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Preview {
    #[serde(default)]
    pub images: Vec<PreviewImage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewImage {
    pub source: PreviewSource,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PreviewSource {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrosspostRef {
    pub id: String,
}

impl RawPost {
    /// Id of the deepest crosspost parent, if this post is a crosspost.
    #[must_use]
    pub fn crosspost_parent(&self) -> Option<&str> {
        self.crosspost_parent_list
            .as_ref()
            .and_then(|list| list.last())
            .map(|parent| parent.id.as_str())
    }

    #[must_use]
    pub fn fullname(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("t3_{}", self.id))
    }
}

impl MediaMetadata {
    /// Preferred rendition: the animated source for gif/mp4 items, else the still image.
    #[must_use]
    pub fn best_url(&self) -> Option<String> {
        let source = self.s.as_ref()?;
        let extension = self.m.as_deref().and_then(|m| m.rsplit('/').next());
        let animated = match extension {
            Some("gif") => source.gif.clone(),
            Some("mp4") => source.mp4.clone(),
            _ => None,
        };
        animated.or_else(|| source.u.clone())
    }
}

/// One entry of a saved listing.
#[derive(Debug, Clone)]
pub enum SourceItem {
    Post(Box<RawPost>),
    /// Anything that is not a link post, such as a saved comment.
    Other { id: String, kind: String },
}

impl SourceItem {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Post(post) => &post.id,
            Self::Other { id, .. } => id,
        }
    }
}

/// One page of a listing plus the cursor for the next one.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<SourceItem>,
    pub after: Option<String>,
}

/// Platform client collaborator.
#[async_trait]
pub trait PostSource: Send + Sync {
    /// One page of the user's saved items, starting after the given cursor.
    async fn saved_page(&self, after: Option<&str>) -> Result<Page>;

    /// Look up items by fullname (`t3_...`). Unknown ids are left out.
    async fn info(&self, fullnames: &[String]) -> Result<Vec<SourceItem>>;

    /// Fetch a single post by bare id.
    async fn post(&self, id: &str) -> Result<Option<RawPost>>;
}

/// Stream every saved item, following page cursors until exhausted.
pub fn saved_items(source: Arc<dyn PostSource>) -> impl Stream<Item = Result<SourceItem>> + Send {
    try_stream! {
        let mut after: Option<String> = None;
        loop {
            let page = source.saved_page(after.as_deref()).await?;
            debug!(count = page.items.len(), after = ?page.after, "Fetched saved page");
            for item in page.items {
                yield item;
            }
            match page.after {
                Some(next) if after.as_deref() != Some(next.as_str()) => after = Some(next),
                _ => break,
            }
        }
    }
}

/// Stream the items named by a list of fullnames, in batches.
pub fn items_by_fullname(
    source: Arc<dyn PostSource>,
    fullnames: Vec<String>,
) -> impl Stream<Item = Result<SourceItem>> + Send {
    try_stream! {
        for batch in fullnames.chunks(INFO_BATCH_SIZE) {
            let items = source.info(batch).await?;
            if items.len() < batch.len() {
                debug!(requested = batch.len(), found = items.len(), "Some ids were not found");
            }
            for item in items {
                yield item;
            }
        }
    }
}

/// Follow crosspost references to the original post.
///
/// A post that is not a crosspost comes back unchanged.
///
/// # Errors
///
/// Returns an error if looking up a parent fails.
pub async fn resolve_crosspost(source: &dyn PostSource, post: RawPost) -> Result<RawPost> {
    let mut current = post;
    for _ in 0..MAX_CROSSPOST_DEPTH {
        let Some(parent_id) = current.crosspost_parent().map(str::to_string) else {
            return Ok(current);
        };
        if parent_id == current.id {
            return Ok(current);
        }

        match source.post(&parent_id).await? {
            Some(parent) => {
                debug!(from = %current.id, to = %parent.id, "Following crosspost");
                current = parent;
            }
            None => {
                warn!(post_id = %current.id, parent_id = %parent_id, "Crosspost parent not found, using crosspost itself");
                return Ok(current);
            }
        }
    }

    warn!(post_id = %current.id, "Crosspost chain too deep, stopping");
    Ok(current)
}

/// Build the domain post from a raw record.
#[must_use]
pub fn to_post(raw: &RawPost, tables: &SourceTables) -> Post {
    let url = raw.url.clone().filter(|u| !u.is_empty());

    let data = if raw.is_self {
        vec![raw.selftext.clone()]
    } else if url
        .as_deref()
        .is_some_and(|u| u.contains(tables.gallery_marker.as_str()))
    {
        gallery_urls(raw)
    } else {
        Vec::new()
    };

    let url_preview = raw
        .preview
        .as_ref()
        .and_then(|p| p.images.first())
        .and_then(|image| image.source.url.clone());

    Post {
        id: raw.id.clone(),
        collection: raw.subreddit.clone(),
        title: raw.title.clone(),
        author: raw
            .author
            .clone()
            .unwrap_or_else(|| "[deleted]".to_string()),
        date: raw.created_utc as i64,
        url,
        url_preview,
        source: raw.domain.clone(),
        data,
    }
}

/// Ordered item URLs of a gallery post. Items without usable metadata are skipped.
fn gallery_urls(raw: &RawPost) -> Vec<String> {
    let Some(gallery) = &raw.gallery_data else {
        debug!(post_id = %raw.id, "Gallery post without gallery data");
        return Vec::new();
    };

    let mut urls = Vec::with_capacity(gallery.items.len());
    for item in &gallery.items {
        let Some(media) = raw
            .media_metadata
            .as_ref()
            .and_then(|m| m.get(&item.media_id))
        else {
            warn!(post_id = %raw.id, media_id = %item.media_id, "Media metadata missing");
            continue;
        };

        match media.best_url() {
            Some(url) => urls.push(url),
            None => {
                warn!(post_id = %raw.id, media_id = %item.media_id, "Media metadata has no source URL");
            }
        }
    }
    urls
}
