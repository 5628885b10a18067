//! Media type detection.
//!
//! Known source domains decide first; a HEAD probe of the content type is the fallback.

use std::collections::HashSet;
use std::fmt;

use reqwest::header::CONTENT_TYPE;
use reqwest::Response;
use serde::Deserialize;
use tracing::debug;

use crate::http::HttpClient;
use crate::http::HttpError;
use crate::posts::Post;

/// What a post or URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    Image,
    Gallery,
    Video,
    Text,
    Unknown,
}

impl MediaType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Gallery => "gallery",
            Self::Video => "video",
            Self::Text => "text",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Domain tables driving classification.
///
/// Loadable from TOML; missing keys keep their defaults:
///
/// ```toml
/// image = ["i.redd.it", "i.imgur.com"]
/// video = ["v.redd.it", "youtube.com"]
/// gallery_marker = "reddit.com/gallery/"
/// self_prefix = "self."
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SourceTables {
    pub image: HashSet<String>,
    pub video: HashSet<String>,
    pub gallery_marker: String,
    pub self_prefix: String,
}

impl Default for SourceTables {
    fn default() -> Self {
        let set = |domains: &[&str]| domains.iter().map(|d| (*d).to_string()).collect();
        Self {
            image: set(&["i.redd.it", "reddit.com", "i.redgifs.com"]),
            video: set(&[
                "youtube.com",
                "youtu.be",
                "v.redd.it",
                "redgifs.com",
                "v3.redgifs.com",
                "gfycat.com",
            ]),
            gallery_marker: "reddit.com/gallery/".to_string(),
            self_prefix: "self.".to_string(),
        }
    }
}

impl SourceTables {
    /// Parse tables from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this shape.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    #[must_use]
    pub fn is_image_source(&self, source: Option<&str>) -> bool {
        source.is_some_and(|s| self.image.contains(s))
    }

    #[must_use]
    pub fn is_video_source(&self, source: Option<&str>) -> bool {
        source.is_some_and(|s| self.video.contains(s))
    }
}

/// Classify from the tables alone. `None` means a content-type probe is needed.
#[must_use]
pub fn classify_known(tables: &SourceTables, source: Option<&str>, url: &str) -> Option<MediaType> {
    if tables.is_video_source(source) {
        return Some(MediaType::Video);
    }
    if url.contains(tables.gallery_marker.as_str()) {
        return Some(MediaType::Gallery);
    }
    if tables.is_image_source(source) {
        return Some(MediaType::Image);
    }
    if source.is_some_and(|s| s.starts_with(tables.self_prefix.as_str())) {
        return Some(MediaType::Text);
    }
    None
}

/// Map a `Content-Type` header value to a media type.
#[must_use]
pub fn media_type_from_content_type(content_type: &str) -> MediaType {
    let lower = content_type.to_ascii_lowercase();
    if lower.contains("image") {
        MediaType::Image
    } else if lower.contains("video") {
        MediaType::Video
    } else {
        MediaType::Unknown
    }
}

/// The response's `Content-Type`, if present and readable.
#[must_use]
pub fn content_type_of(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
}

/// File extension (without dot) for a content type.
#[must_use]
pub fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let known = match essence.as_str() {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "image/webp" => Some("webp"),
        "image/avif" => Some("avif"),
        "image/bmp" => Some("bmp"),
        "image/tiff" => Some("tiff"),
        "image/svg+xml" => Some("svg"),
        "video/mp4" => Some("mp4"),
        "video/webm" => Some("webm"),
        "video/quicktime" => Some("mov"),
        _ => None,
    };

    known.or_else(|| {
        mime_guess::get_mime_extensions_str(&essence).and_then(|exts| exts.first().copied())
    })
}

/// Classifier with a HEAD probe fallback.
#[derive(Debug, Clone)]
pub struct Classifier {
    http: HttpClient,
    tables: SourceTables,
}

impl Classifier {
    #[must_use]
    pub fn new(http: HttpClient, tables: SourceTables) -> Self {
        Self { http, tables }
    }

    #[must_use]
    pub fn tables(&self) -> &SourceTables {
        &self.tables
    }

    /// Decide what `url` (found on `post`) points at.
    ///
    /// # Errors
    ///
    /// Returns an error if the content-type probe fails at the transport level.
    pub async fn classify(&self, post: &Post, url: &str) -> Result<MediaType, HttpError> {
        if let Some(known) = classify_known(&self.tables, post.source.as_deref(), url) {
            debug!(post_id = %post.id, media_type = %known, "Source detected");
            return Ok(known);
        }

        debug!(post_id = %post.id, url = %url, "Unknown source, probing content type");
        let response = self.http.head(url).await?;
        let guess = content_type_of(&response).map_or(MediaType::Unknown, media_type_from_content_type);
        if guess == MediaType::Unknown {
            debug!(url = %url, "Failed to guess post format");
        } else {
            debug!(url = %url, media_type = %guess, "Guessed post format");
        }
        Ok(guess)
    }
}
