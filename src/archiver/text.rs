//! Self-post text output.

use std::path::{Path, PathBuf};

use super::image::with_extension;
use super::FetchError;

/// Write `lines` joined by newlines to `<target>.md`.
///
/// # Errors
///
/// Returns [`FetchError::Io`] if the file cannot be written.
pub async fn write_text(lines: &[String], target: &Path) -> Result<PathBuf, FetchError> {
    let path = with_extension(target, "md");
    tokio::fs::write(&path, lines.join("\n"))
        .await
        .map_err(|e| FetchError::io(&path, e))?;
    Ok(path)
}
