use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::http::HttpError;

pub mod classify;
pub mod downloader;
pub mod gallery;
pub mod image;
pub mod text;
pub mod worker;
pub mod ytdlp;

pub use classify::{Classifier, MediaType, SourceTables};
pub use downloader::Downloader;
pub use worker::{ArchiveWorker, RunSummary};
pub use ytdlp::{VideoEngine, VideoFetcher, YtDlp};

/// Failure of a fetch strategy that is not simply "nothing found".
#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("video engine unavailable: {0}")]
    Engine(String),
}

impl FetchError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Turn a collection name into a single safe directory name.
///
/// Path separators and characters that are awkward on common filesystems
/// become underscores, runs of underscores collapse, and names that would
/// escape the output directory (`.`, `..`, empty) are replaced.
///
/// ```
/// # use saved_post_archiver::archiver::sanitize_path_component;
/// assert_eq!(sanitize_path_component("pics"), "pics");
/// assert_eq!(sanitize_path_component("../etc"), "etc");
/// ```
#[must_use]
pub fn sanitize_path_component(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '#' | '%' | '&' => '_',
            c if c.is_control() || c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    let collapsed = replaced
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    // No leading dots: hidden files and parent directory references.
    let trimmed = collapsed.trim_start_matches(['.', '_']);

    const MAX_LENGTH: usize = 200;
    let truncated: String = trimmed.chars().take(MAX_LENGTH).collect();

    if truncated.is_empty() {
        "_".to_string()
    } else {
        truncated
    }
}
