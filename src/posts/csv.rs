//! Import of the saved-posts CSV from a Reddit data export.

use std::path::Path;

use anyhow::{Context, Result};

/// Kind prefix of link posts.
pub const POST_PREFIX: &str = "t3_";

/// Load post fullnames from a data-export CSV.
///
/// The first row is a header. The first column of every other row is a post
/// id, with or without the `t3_` prefix.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn load_saved_posts_csv(path: &Path) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read CSV file: {}", path.display()))?;
    Ok(parse_saved_posts_csv(&content))
}

fn parse_saved_posts_csv(content: &str) -> Vec<String> {
    content
        .lines()
        .skip(1)
        .filter_map(first_column)
        .map(|id| ensure_fullname(&id))
        .collect()
}

fn first_column(line: &str) -> Option<String> {
    let line = line.trim_start_matches('\u{feff}').trim();
    let field = line.split(',').next()?.trim().trim_matches('"').trim();
    if field.is_empty() {
        None
    } else {
        Some(field.to_string())
    }
}

/// Make sure an id carries the `t3_` post prefix.
#[must_use]
pub fn ensure_fullname(id: &str) -> String {
    if id.starts_with(POST_PREFIX) {
        id.to_string()
    } else {
        format!("{POST_PREFIX}{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_fullname() {
        assert_eq!(ensure_fullname("abc123"), "t3_abc123");
        assert_eq!(ensure_fullname("t3_abc123"), "t3_abc123");
    }

    #[test]
    fn test_parse_skips_header_and_normalizes() {
        let csv = "id,permalink\nabc,https://www.reddit.com/r/x/comments/abc/\nt3_def,https://www.reddit.com/r/x/comments/def/\n";
        assert_eq!(parse_saved_posts_csv(csv), vec!["t3_abc", "t3_def"]);
    }

    #[test]
    fn test_parse_quoted_and_blank_lines() {
        let csv = "\u{feff}\"id\",\"permalink\"\r\n\"ghi\",\"https://example\"\r\n\r\n";
        assert_eq!(parse_saved_posts_csv(csv), vec!["t3_ghi"]);
    }

    #[test]
    fn test_parse_header_only() {
        assert!(parse_saved_posts_csv("id,permalink\n").is_empty());
        assert!(parse_saved_posts_csv("").is_empty());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("saved_posts.csv");
        tokio::fs::write(&path, "id,permalink\nxyz,https://example\n")
            .await
            .unwrap();

        let ids = load_saved_posts_csv(&path).await.unwrap();
        assert_eq!(ids, vec!["t3_xyz"]);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        assert!(load_saved_posts_csv(Path::new("/nonexistent/saved.csv"))
            .await
            .is_err());
    }
}
