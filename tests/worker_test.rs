//! Integration tests for the archive run loop.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use saved_post_archiver::archiver::ytdlp::EngineError;
use saved_post_archiver::archiver::{ArchiveWorker, Downloader, VideoEngine};
use saved_post_archiver::config::Config;
use saved_post_archiver::posts::{Page, PostSource, RawPost, SourceItem};
use saved_post_archiver::state::{ItemStatus, StatusStore};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{any, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Saved list and post lookups served from memory.
#[derive(Default)]
struct FakeSource {
    saved: Vec<SourceItem>,
    posts: HashMap<String, RawPost>,
}

#[async_trait]
impl PostSource for FakeSource {
    async fn saved_page(&self, _after: Option<&str>) -> Result<Page> {
        Ok(Page {
            items: self.saved.clone(),
            after: None,
        })
    }

    async fn info(&self, fullnames: &[String]) -> Result<Vec<SourceItem>> {
        Ok(fullnames
            .iter()
            .filter_map(|f| self.posts.get(f.trim_start_matches("t3_")))
            .map(|p| SourceItem::Post(Box::new(p.clone())))
            .collect())
    }

    async fn post(&self, id: &str) -> Result<Option<RawPost>> {
        Ok(self.posts.get(id).cloned())
    }
}

/// Video engine that writes an `.mp4` for every URL it is given.
#[derive(Default)]
struct FakeEngine {
    urls: Mutex<Vec<String>>,
}

#[async_trait]
impl VideoEngine for FakeEngine {
    async fn fetch(&self, url: &str, output_template: &str) -> Result<(), EngineError> {
        self.urls.lock().unwrap().push(url.to_string());
        std::fs::write(output_template.replace("%(ext)s", "mp4"), b"video")
            .map_err(|e| EngineError::Download(e.to_string()))
    }
}

fn raw(json: serde_json::Value) -> RawPost {
    serde_json::from_value(json).unwrap()
}

fn image_post(id: &str, url: &str) -> RawPost {
    raw(serde_json::json!({
        "id": id,
        "subreddit": "pics",
        "title": format!("Post {id}"),
        "author": "alice",
        "created_utc": 1_600_000_000.0,
        "url": url,
        "domain": "i.redd.it",
    }))
}

fn test_config(output_dir: &Path, server: &MockServer) -> Config {
    Config {
        output_dir: output_dir.to_path_buf(),
        wayback_cdx_url: format!("{}/cdx", server.uri()),
        wayback_snapshot_base: format!("{}/web", server.uri()),
        ..Config::for_testing()
    }
}

fn worker(config: &Config, source: FakeSource, engine: Arc<FakeEngine>) -> ArchiveWorker {
    worker_with_token(config, source, engine, CancellationToken::new())
}

fn worker_with_token(
    config: &Config,
    source: FakeSource,
    engine: Arc<FakeEngine>,
    shutdown: CancellationToken,
) -> ArchiveWorker {
    let downloader = Downloader::from_config(config, engine).unwrap();
    let store = StatusStore::load(config.status_path());
    ArchiveWorker::new(config.clone(), Arc::new(source), downloader, store, shutdown)
}

async fn serve_jpeg(server: &MockServer, at: &str) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/jpeg")
                .set_body_bytes(vec![0xff, 0xd8, 0xff]),
        )
        .mount(server)
        .await;
}

fn read_json(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap().len()
}

#[tokio::test]
async fn test_image_post_downloaded_with_sidecar() {
    let server = MockServer::start().await;
    serve_jpeg(&server, "/x.jpg").await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let source = FakeSource {
        saved: vec![SourceItem::Post(Box::new(image_post(
            "abc",
            &format!("{}/x.jpg", server.uri()),
        )))],
        ..FakeSource::default()
    };

    let mut worker = worker(&config, source, Arc::default());
    let summary = worker.download_saved(false).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert!(!summary.interrupted);
    assert!(dir.path().join("pics").join("abc.jpg").is_file());

    let sidecar = read_json(&dir.path().join("pics").join("abc.json"));
    assert_eq!(sidecar["id"], "abc");
    assert_eq!(sidecar["sub"], "pics");
    assert_eq!(sidecar["author"], "alice");
    assert_eq!(sidecar["date"], 1_600_000_000);
    assert_eq!(sidecar["files"], serde_json::json!(["abc.jpg"]));

    let status = read_json(&config.status_path());
    assert_eq!(status["abc"], "downloaded");
}

#[tokio::test]
async fn test_removed_post_skipped_without_network() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let removed = raw(serde_json::json!({
        "id": "gone",
        "subreddit": "pics",
        "url": "",
        "domain": "self.pics",
        "is_self": true,
        "selftext": "[removed]",
    }));
    let source = FakeSource {
        saved: vec![SourceItem::Post(Box::new(removed))],
        ..FakeSource::default()
    };

    let mut worker = worker(&config, source, Arc::default());
    let summary = worker.download_saved(false).await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(worker.store().get("gone"), Some(ItemStatus::Skipped));
    assert!(!dir.path().join("pics").exists());
}

#[tokio::test]
async fn test_rerun_does_not_refetch_downloaded_posts() {
    let server = MockServer::start().await;
    serve_jpeg(&server, "/x.jpg").await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let post = image_post("abc", &format!("{}/x.jpg", server.uri()));
    let source = || FakeSource {
        saved: vec![SourceItem::Post(Box::new(post.clone()))],
        ..FakeSource::default()
    };

    worker(&config, source(), Arc::default())
        .download_saved(false)
        .await
        .unwrap();
    let after_first = request_count(&server).await;
    assert!(after_first > 0);

    let summary = worker(&config, source(), Arc::default())
        .download_saved(false)
        .await
        .unwrap();
    assert_eq!(summary.already_handled, 1);
    assert_eq!(summary.downloaded, 0);
    assert_eq!(request_count(&server).await, after_first);
}

#[tokio::test]
async fn test_failed_post_retried_unless_skip_failed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cdx"))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let post = image_post("abc", &format!("{}/missing.jpg", server.uri()));
    let source = || FakeSource {
        saved: vec![SourceItem::Post(Box::new(post.clone()))],
        ..FakeSource::default()
    };

    let summary = worker(&config, source(), Arc::default())
        .download_saved(false)
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(read_json(&config.status_path())["abc"], "failed");
    let after_first = request_count(&server).await;

    let summary = worker(&config, source(), Arc::default())
        .download_saved(true)
        .await
        .unwrap();
    assert_eq!(summary.already_handled, 1);
    assert_eq!(request_count(&server).await, after_first);

    let summary = worker(&config, source(), Arc::default())
        .download_saved(false)
        .await
        .unwrap();
    assert_eq!(summary.failed, 1);
    assert!(request_count(&server).await > after_first);
}

#[tokio::test]
async fn test_failed_post_upgraded_to_downloaded() {
    let server = MockServer::start().await;
    serve_jpeg(&server, "/x.jpg").await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let mut store = StatusStore::load(config.status_path());
    store.record("abc", ItemStatus::Failed);
    store.save().unwrap();

    let source = FakeSource {
        saved: vec![SourceItem::Post(Box::new(image_post(
            "abc",
            &format!("{}/x.jpg", server.uri()),
        )))],
        ..FakeSource::default()
    };
    let summary = worker(&config, source, Arc::default())
        .download_saved(false)
        .await
        .unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(read_json(&config.status_path())["abc"], "downloaded");
}

#[tokio::test]
async fn test_crosspost_recorded_under_both_ids() {
    let server = MockServer::start().await;
    serve_jpeg(&server, "/original.jpg").await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let crosspost = raw(serde_json::json!({
        "id": "xpost",
        "subreddit": "reposts",
        "url": "https://www.reddit.com/r/pics/comments/orig/",
        "domain": "self.reposts",
        "crosspost_parent_list": [{"id": "orig"}],
    }));
    let mut original = image_post("orig", &format!("{}/original.jpg", server.uri()));
    original.subreddit = "pics".to_string();

    let source = FakeSource {
        saved: vec![SourceItem::Post(Box::new(crosspost))],
        posts: HashMap::from([("orig".to_string(), original)]),
    };
    let mut worker = worker(&config, source, Arc::default());
    worker.download_saved(false).await.unwrap();

    assert_eq!(worker.store().get("xpost"), Some(ItemStatus::Downloaded));
    assert_eq!(worker.store().get("orig"), Some(ItemStatus::Downloaded));
    assert!(dir.path().join("pics").join("orig.jpg").is_file());
    assert!(dir.path().join("pics").join("orig.json").is_file());
}

#[tokio::test]
async fn test_crosspost_of_downloaded_post_short_circuits() {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let mut store = StatusStore::load(config.status_path());
    store.record("orig", ItemStatus::Downloaded);
    store.save().unwrap();

    let crosspost = raw(serde_json::json!({
        "id": "xpost",
        "subreddit": "reposts",
        "crosspost_parent_list": [{"id": "orig"}],
    }));
    let original = image_post("orig", &format!("{}/original.jpg", server.uri()));
    let source = FakeSource {
        saved: vec![SourceItem::Post(Box::new(crosspost))],
        posts: HashMap::from([("orig".to_string(), original)]),
    };

    let mut worker = worker(&config, source, Arc::default());
    let summary = worker.download_saved(false).await.unwrap();
    assert_eq!(summary.already_handled, 1);
    assert_eq!(worker.store().get("xpost"), Some(ItemStatus::Downloaded));
}

#[tokio::test]
async fn test_comment_is_skipped_once() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let source = || FakeSource {
        saved: vec![SourceItem::Other {
            id: "c1".to_string(),
            kind: "t1".to_string(),
        }],
        ..FakeSource::default()
    };

    let mut first = worker(&config, source(), Arc::default());
    let summary = first.download_saved(false).await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(first.store().get("c1"), Some(ItemStatus::Skipped));

    let summary = worker(&config, source(), Arc::default())
        .download_saved(false)
        .await
        .unwrap();
    assert_eq!(summary.skipped, 0);
    assert_eq!(summary.already_handled, 1);
}

#[tokio::test]
async fn test_status_saved_every_few_downloads() {
    let server = MockServer::start().await;
    serve_jpeg(&server, "/x.jpg").await;

    let dir = TempDir::new().unwrap();
    let config = Config {
        save_every: 2,
        ..test_config(dir.path(), &server)
    };
    let url = format!("{}/x.jpg", server.uri());
    let post = |id: &str| -> anyhow::Result<SourceItem> {
        Ok(SourceItem::Post(Box::new(image_post(id, &url))))
    };

    // Peek at the status file while the run is still going.
    let status_path = config.status_path();
    let snapshots = Arc::new(Mutex::new(Vec::new()));
    let peek = |next: anyhow::Result<SourceItem>| {
        let status_path = status_path.clone();
        let snapshots = Arc::clone(&snapshots);
        stream::once(async move {
            snapshots
                .lock()
                .unwrap()
                .push(std::fs::read_to_string(&status_path).ok());
            next
        })
    };
    let items = stream::iter(vec![post("a")])
        .chain(peek(post("b")))
        .chain(peek(Ok(SourceItem::Other {
            id: "c1".to_string(),
            kind: "t1".to_string(),
        })));

    let mut worker = worker(&config, FakeSource::default(), Arc::default());
    let summary = worker.run(items, false).await.unwrap();
    assert_eq!(summary.downloaded, 2);

    let seen = snapshots.lock().unwrap();
    assert_eq!(seen[0], None);
    let mid_run: serde_json::Value = serde_json::from_str(seen[1].as_deref().unwrap()).unwrap();
    assert_eq!(mid_run["a"], "downloaded");
    assert_eq!(mid_run["b"], "downloaded");
    assert!(mid_run.get("c1").is_none());
}

#[tokio::test]
async fn test_video_post_uses_engine() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let video = raw(serde_json::json!({
        "id": "vid",
        "subreddit": "videos",
        "url": format!("{}/vid", server.uri()),
        "domain": "v.redd.it",
    }));
    let source = FakeSource {
        saved: vec![SourceItem::Post(Box::new(video))],
        ..FakeSource::default()
    };

    let engine = Arc::new(FakeEngine::default());
    let mut worker = worker(&config, source, Arc::clone(&engine));
    let summary = worker.download_saved(false).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(
        *engine.urls.lock().unwrap(),
        vec![format!("{}/vid", server.uri())]
    );
    let sidecar = read_json(&dir.path().join("videos").join("vid.json"));
    assert_eq!(sidecar["files"], serde_json::json!(["vid.mp4"]));
}

#[tokio::test]
async fn test_gallery_partial_success() {
    let server = MockServer::start().await;
    serve_jpeg(&server, "/a.jpg").await;
    serve_jpeg(&server, "/c.jpg").await;
    Mock::given(method("GET"))
        .and(path("/b.jpg"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let media = |name: &str| {
        serde_json::json!({"m": "image/jpg", "s": {"u": format!("{}/{name}", server.uri())}})
    };
    let gallery = raw(serde_json::json!({
        "id": "gal",
        "subreddit": "pics",
        "url": format!("{}/reddit.com/gallery/gal", server.uri()),
        "domain": "reddit.com",
        "gallery_data": {"items": [{"media_id": "m1"}, {"media_id": "m2"}, {"media_id": "m3"}]},
        "media_metadata": {"m1": media("a.jpg"), "m2": media("b.jpg"), "m3": media("c.jpg")},
    }));
    let source = FakeSource {
        saved: vec![SourceItem::Post(Box::new(gallery))],
        ..FakeSource::default()
    };

    let mut worker = worker(&config, source, Arc::default());
    let summary = worker.download_saved(false).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    let sidecar = read_json(&dir.path().join("pics").join("gal.json"));
    assert_eq!(sidecar["files"], serde_json::json!(["gal/0.jpg", "gal/2.jpg"]));
    for file in ["0.jpg", "2.jpg"] {
        assert!(dir.path().join("pics").join("gal").join(file).is_file());
    }
}

#[tokio::test]
async fn test_cancelled_run_still_saves_status() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    let source = FakeSource {
        saved: vec![SourceItem::Post(Box::new(image_post(
            "abc",
            &format!("{}/x.jpg", server.uri()),
        )))],
        ..FakeSource::default()
    };

    let token = CancellationToken::new();
    token.cancel();
    let mut worker = worker_with_token(&config, source, Arc::default(), token);
    let summary = worker.download_saved(false).await.unwrap();

    assert!(summary.interrupted);
    assert_eq!(summary.downloaded, 0);
    assert!(config.status_path().is_file());
    assert_eq!(request_count(&server).await, 0);
}

#[tokio::test]
async fn test_csv_flow() {
    let server = MockServer::start().await;
    serve_jpeg(&server, "/x.jpg").await;

    let dir = TempDir::new().unwrap();
    let config = test_config(&dir.path().join("out"), &server);
    let csv = dir.path().join("saved_posts.csv");
    std::fs::write(&csv, "id,permalink\nabc,https://www.reddit.com/r/pics/comments/abc/\nmissing,x\n")
        .unwrap();

    let source = FakeSource {
        posts: HashMap::from([(
            "abc".to_string(),
            image_post("abc", &format!("{}/x.jpg", server.uri())),
        )]),
        ..FakeSource::default()
    };
    let mut worker = worker(&config, source, Arc::default());
    let summary = worker.download_csv(&csv, false).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert!(dir.path().join("out").join("pics").join("abc.jpg").is_file());
}

#[tokio::test]
async fn test_unwritable_output_is_fatal_but_status_saved() {
    let server = MockServer::start().await;
    serve_jpeg(&server, "/x.jpg").await;

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), &server);
    // A file where the collection directory should go.
    std::fs::write(dir.path().join("pics"), b"").unwrap();

    let source = FakeSource {
        saved: vec![
            SourceItem::Other {
                id: "c1".to_string(),
                kind: "t1".to_string(),
            },
            SourceItem::Post(Box::new(image_post("abc", &format!("{}/x.jpg", server.uri())))),
        ],
        ..FakeSource::default()
    };

    let mut worker = worker(&config, source, Arc::default());
    assert!(worker.download_saved(false).await.is_err());
    assert_eq!(read_json(&config.status_path())["c1"], "skipped");
}
