//! Single-file image download.

use std::path::{Path, PathBuf};

use reqwest::StatusCode;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

use super::classify::{content_type_of, extension_for};
use super::FetchError;
use crate::constants::WRITE_CHUNK_SIZE;
use crate::http::{HttpClient, HttpError};

/// Extension used when the content type maps to nothing known.
const FALLBACK_EXTENSION: &str = "bin";

/// Extensions taken by files the archiver writes next to a post.
const RESERVED_EXTENSIONS: &[&str] = &["json"];

/// Download `url` to `<target>.<ext>`.
///
/// Returns `Ok(None)` unless the server answers exactly `200 OK`.
///
/// # Errors
///
/// Returns [`FetchError::Http`] on transport failure and [`FetchError::Io`]
/// when the file cannot be written.
pub async fn download_image(
    http: &HttpClient,
    url: &str,
    target: &Path,
) -> Result<Option<PathBuf>, FetchError> {
    let mut response = http.get(url).await?;
    if response.status() != StatusCode::OK {
        debug!(url = %url, status = %response.status(), "Image fetch did not return 200");
        return Ok(None);
    }

    let content_type = content_type_of(&response).unwrap_or_default().to_string();
    let extension = extension_for(&content_type)
        .filter(|ext| !RESERVED_EXTENSIONS.contains(ext))
        .unwrap_or_else(|| {
            warn!(
                url = %url,
                content_type = %content_type,
                "Unknown content type, saving as .{FALLBACK_EXTENSION}"
            );
            FALLBACK_EXTENSION
        });
    let path = with_extension(target, extension);

    let file = File::create(&path).await.map_err(|e| FetchError::io(&path, e))?;
    let mut writer = BufWriter::with_capacity(WRITE_CHUNK_SIZE, file);
    loop {
        let chunk = match response.chunk().await {
            Ok(chunk) => chunk,
            Err(e) => {
                // Don't leave a truncated file behind for a body that broke off.
                drop(writer);
                let _ = tokio::fs::remove_file(&path).await;
                return Err(HttpError::Request {
                    url: url.to_string(),
                    source: e,
                }
                .into());
            }
        };
        let Some(bytes) = chunk else { break };
        writer
            .write_all(&bytes)
            .await
            .map_err(|e| FetchError::io(&path, e))?;
    }
    writer.flush().await.map_err(|e| FetchError::io(&path, e))?;

    debug!(url = %url, path = %path.display(), "Image saved");
    Ok(Some(path))
}

/// Append `.ext` to the full file name, keeping any dots already in it.
pub(crate) fn with_extension(target: &Path, extension: &str) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}
