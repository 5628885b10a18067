//! Multi-item gallery download.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::image::download_image;
use super::FetchError;
use crate::http::HttpClient;

/// Download every gallery item into `dir`, item `i` as `dir/<i>.<ext>`.
///
/// Items that fail are logged and left out; the rest are still fetched.
/// An empty list writes nothing.
///
/// # Errors
///
/// Returns [`FetchError::Io`] if the directory or a file cannot be written.
pub async fn download_gallery(
    http: &HttpClient,
    urls: &[String],
    dir: &Path,
) -> Result<Vec<PathBuf>, FetchError> {
    if urls.is_empty() {
        return Ok(Vec::new());
    }
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| FetchError::io(dir, e))?;

    let mut saved = Vec::with_capacity(urls.len());
    for (index, url) in urls.iter().enumerate() {
        let target = dir.join(index.to_string());
        match download_image(http, url, &target).await {
            Ok(Some(path)) => {
                debug!(index, url = %url, "Gallery item saved");
                saved.push(path);
            }
            Ok(None) => warn!(index, url = %url, "Gallery item unavailable"),
            Err(FetchError::Http(e)) => warn!(index, url = %url, error = %e, "Gallery item failed"),
            Err(e) => return Err(e),
        }
    }

    info!(saved = saved.len(), total = urls.len(), dir = %dir.display(), "Gallery done");
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::http::HttpSettings;

    #[tokio::test]
    async fn test_partial_success_keeps_going() {
        let server = MockServer::start().await;
        for (name, ct) in [("/a", "image/jpeg"), ("/c", "image/png")] {
            Mock::given(method("GET"))
                .and(path(name))
                .respond_with(
                    ResponseTemplate::new(200)
                        .insert_header("content-type", ct)
                        .set_body_bytes(b"img".to_vec()),
                )
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let gallery = dir.path().join("abc");
        let urls: Vec<String> = ["/a", "/b", "/c"]
            .iter()
            .map(|p| format!("{}{p}", server.uri()))
            .collect();

        let http = HttpClient::new(HttpSettings::default()).unwrap();
        let saved = download_gallery(&http, &urls, &gallery).await.unwrap();

        assert_eq!(saved, vec![gallery.join("0.jpg"), gallery.join("2.png")]);
        assert!(saved.iter().all(|p| p.exists()));
    }

    #[tokio::test]
    async fn test_transport_failure_is_one_item() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-type", "image/gif"))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let urls = vec!["http://127.0.0.1:9/dead".to_string(), server.uri()];
        let http = HttpClient::new(HttpSettings {
            max_tries: 1,
            ..HttpSettings::default()
        })
        .unwrap();

        let saved = download_gallery(&http, &urls, dir.path()).await.unwrap();
        assert_eq!(saved, vec![dir.path().join("1.gif")]);
    }

    #[tokio::test]
    async fn test_empty_gallery() {
        let dir = TempDir::new().unwrap();
        let http = HttpClient::new(HttpSettings::default()).unwrap();
        let saved = download_gallery(&http, &[], &dir.path().join("g")).await.unwrap();
        assert!(saved.is_empty());
        assert!(!dir.path().join("g").exists());
    }
}
