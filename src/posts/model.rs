use std::fmt;

/// Payloads left behind when a self post was removed.
pub const REMOVED_SENTINELS: &[&str] = &[
    "[removed]",
    "[ Removed by Reddit in response to a copyright notice. ]",
];

/// A saved post, reduced to what the downloader needs.
///
/// Built fresh for every queue item; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    /// Stable post id (without the `t3_` kind prefix).
    pub id: String,
    /// Subreddit or other collection the post belongs to.
    pub collection: String,
    pub title: String,
    pub author: String,
    /// Creation time, seconds since the Unix epoch.
    pub date: i64,
    /// Link target of the post.
    pub url: Option<String>,
    /// Platform-cached preview image.
    pub url_preview: Option<String>,
    /// Domain reported by the platform, e.g. `i.redd.it` or `self.rust`.
    pub source: Option<String>,
    /// Self text paragraphs or gallery item URLs.
    pub data: Vec<String>,
}

impl Post {
    /// Whether the post has anything worth attempting.
    #[must_use]
    pub fn is_good(&self) -> bool {
        self.url.is_some() || self.url_preview.is_some() || self.has_payload()
    }

    fn has_payload(&self) -> bool {
        match self.data.as_slice() {
            [] => false,
            [only] => !REMOVED_SENTINELS.contains(&only.as_str()),
            _ => true,
        }
    }
}

impl fmt::Display for Post {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from r/{} by u/{} ({})",
            self.id,
            self.collection,
            self.author,
            self.url.as_deref().unwrap_or("no url")
        )
    }
}
