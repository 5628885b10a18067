//! Video download through yt-dlp.
//!
//! The engine is behind [`VideoEngine`] so the retry policy in
//! [`VideoFetcher`] can be exercised without spawning a process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, warn};
use url::Url;

use super::FetchError;
use crate::http::is_archive_overload;

/// Extensions of engine by-products that are never the downloaded media.
const SIDECAR_EXTENSIONS: &[&str] = &["json", "part", "ytdl"];

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{0}")]
    Download(String),
    #[error("timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),
}

/// How the video fetcher should react to an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineFailure {
    /// The resource no longer exists; retrying is pointless.
    Gone,
    /// The engine has no extractor for the URL.
    Unsupported,
    /// The archive host is refusing connections.
    Overloaded,
    Other,
}

/// Map an engine error message to a failure kind.
///
/// All knowledge of the engine's message wording lives here.
#[must_use]
pub fn classify_engine_error(message: &str) -> EngineFailure {
    if message.contains("HTTP Error 404") || message.contains("HTTP Error 410") {
        EngineFailure::Gone
    } else if message.contains("Unsupported URL") {
        EngineFailure::Unsupported
    } else if is_archive_overload(message) {
        EngineFailure::Overloaded
    } else {
        EngineFailure::Other
    }
}

/// An external "fetch this URL to this path" capability.
#[async_trait]
pub trait VideoEngine: Send + Sync {
    /// Download `url`, writing to `output_template` (`<stem>.%(ext)s`).
    async fn fetch(&self, url: &str, output_template: &str) -> Result<(), EngineError>;
}

/// The yt-dlp command line program.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: String,
    timeout: Duration,
}

impl YtDlp {
    #[must_use]
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    /// Check if the program can be run.
    pub async fn is_available(&self) -> bool {
        Command::new(&self.program)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl VideoEngine for YtDlp {
    async fn fetch(&self, url: &str, output_template: &str) -> Result<(), EngineError> {
        debug!(url = %url, output = %output_template, "Running yt-dlp");

        let run = Command::new(&self.program)
            .args(["--no-playlist", "--no-progress", "--no-warnings", "--output"])
            .arg(output_template)
            .arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))?
            .map_err(|e| EngineError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let errors: Vec<&str> = stderr
            .lines()
            .filter(|line| line.starts_with("ERROR:"))
            .collect();
        let message = if errors.is_empty() {
            let trimmed = stderr.trim();
            if trimmed.is_empty() {
                format!("yt-dlp exited with {}", output.status)
            } else {
                trimmed.to_string()
            }
        } else {
            errors.join("\n")
        };
        Err(EngineError::Download(message))
    }
}

/// Video download with the skip/retry policy around an engine.
#[derive(Clone)]
pub struct VideoFetcher {
    engine: Arc<dyn VideoEngine>,
    max_tries: u32,
    cooldown: Duration,
    archive_host: String,
}

impl VideoFetcher {
    #[must_use]
    pub fn new(
        engine: Arc<dyn VideoEngine>,
        max_tries: u32,
        cooldown: Duration,
        archive_host: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            max_tries: max_tries.max(1),
            cooldown,
            archive_host: archive_host.into(),
        }
    }

    fn is_archive_url(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .is_some_and(|u| u.host_str() == Some(self.archive_host.as_str()))
    }

    /// Download the video at `url` next to `target`, returning the file written.
    ///
    /// Gone and unsupported URLs return `Ok(None)` straight away. Other
    /// engine failures are retried, and give `Ok(None)` once tries run out.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Engine`] if the engine cannot be started and
    /// [`FetchError::Io`] if the output directory cannot be read.
    pub async fn fetch(&self, url: &str, target: &Path) -> Result<Option<PathBuf>, FetchError> {
        let template = format!("{}.%(ext)s", target.display());

        for attempt in 1..=self.max_tries {
            let message = match self.engine.fetch(url, &template).await {
                Ok(()) => return find_output(target).await,
                Err(e @ EngineError::Spawn { .. }) => return Err(FetchError::Engine(e.to_string())),
                Err(e) => e.to_string(),
            };

            match classify_engine_error(&message) {
                EngineFailure::Gone => {
                    debug!(url = %url, error = %message, "Video is gone");
                    return Ok(None);
                }
                EngineFailure::Unsupported => {
                    warn!(url = %url, "Unsupported URL for video download");
                    return Ok(None);
                }
                EngineFailure::Overloaded if self.is_archive_url(url) => {
                    warn!(
                        url = %url,
                        attempt,
                        cooldown_secs = self.cooldown.as_secs(),
                        "Video host is rate limiting, cooling off"
                    );
                    if attempt < self.max_tries {
                        sleep(self.cooldown).await;
                    }
                }
                EngineFailure::Overloaded | EngineFailure::Other => {
                    debug!(url = %url, attempt, max_tries = self.max_tries, error = %message, "Video download failed");
                }
            }
        }

        Ok(None)
    }
}

/// Find the file the engine wrote for `target`, whatever extension it chose.
async fn find_output(target: &Path) -> Result<Option<PathBuf>, FetchError> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let Some(stem) = target.file_name() else {
        return Ok(None);
    };

    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| FetchError::io(dir, e))?;
    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| FetchError::io(dir, e))?
    {
        let path = entry.path();
        let is_sidecar = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| SIDECAR_EXTENSIONS.contains(&e));
        if path.file_stem() == Some(stem) && !is_sidecar && path.is_file() {
            found.push(path);
        }
    }

    found.sort();
    let output = found.into_iter().next();
    if output.is_none() {
        warn!(target = %target.display(), "Engine reported success but wrote no file");
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    use tempfile::TempDir;

    use super::*;

    /// Engine that replays a script of outcomes, writing `.mp4` on success.
    struct ScriptedEngine {
        outcomes: Mutex<VecDeque<Result<(), EngineError>>>,
        calls: Mutex<u32>,
        write_file: bool,
    }

    impl ScriptedEngine {
        fn new(outcomes: Vec<Result<(), EngineError>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: Mutex::new(0),
                write_file: true,
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl VideoEngine for ScriptedEngine {
        async fn fetch(&self, _url: &str, output_template: &str) -> Result<(), EngineError> {
            *self.calls.lock().unwrap() += 1;
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(EngineError::Download("script exhausted".into())));
            if outcome.is_ok() && self.write_file {
                std::fs::write(output_template.replace("%(ext)s", "mp4"), b"video").unwrap();
            }
            outcome
        }
    }

    fn failure(message: &str) -> Result<(), EngineError> {
        Err(EngineError::Download(message.to_string()))
    }

    #[test]
    fn test_classify_engine_error() {
        assert_eq!(
            classify_engine_error("ERROR: [generic] abc: Unable to download webpage: HTTP Error 404: Not Found"),
            EngineFailure::Gone
        );
        assert_eq!(
            classify_engine_error("ERROR: HTTP Error 410: Gone"),
            EngineFailure::Gone
        );
        assert_eq!(
            classify_engine_error("ERROR: Unsupported URL: https://example.com/page"),
            EngineFailure::Unsupported
        );
        assert_eq!(
            classify_engine_error("ERROR: <urlopen error [Errno 61] Connection refused>"),
            EngineFailure::Overloaded
        );
        assert_eq!(
            classify_engine_error("ERROR: HTTP Error 403: Forbidden"),
            EngineFailure::Other
        );
    }

    #[tokio::test]
    async fn test_success_finds_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("abc.info.json"), b"{}").unwrap();
        let engine = ScriptedEngine::new(vec![Ok(())]);
        let fetcher = VideoFetcher::new(engine.clone(), 3, Duration::ZERO, "web.archive.org");

        let saved = fetcher
            .fetch("https://v.redd.it/abc", &dir.path().join("abc"))
            .await
            .unwrap();
        assert_eq!(saved, Some(dir.path().join("abc.mp4")));
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![failure("ERROR: HTTP Error 404: Not Found")]);
        let fetcher = VideoFetcher::new(engine.clone(), 3, Duration::ZERO, "web.archive.org");

        let saved = fetcher
            .fetch("https://v.redd.it/abc", &dir.path().join("abc"))
            .await
            .unwrap();
        assert!(saved.is_none());
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![failure("ERROR: Unsupported URL: x")]);
        let fetcher = VideoFetcher::new(engine.clone(), 3, Duration::ZERO, "web.archive.org");

        assert!(fetcher
            .fetch("x", &dir.path().join("abc"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_other_errors_retried_until_success() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![
            failure("ERROR: HTTP Error 503: Service Unavailable"),
            failure("ERROR: [Errno 61] Connection refused"),
            Ok(()),
        ]);
        let fetcher = VideoFetcher::new(engine.clone(), 3, Duration::ZERO, "web.archive.org");

        let saved = fetcher
            .fetch("https://v.redd.it/abc", &dir.path().join("abc"))
            .await
            .unwrap();
        assert!(saved.is_some());
        assert_eq!(engine.calls(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_tries() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![
            failure("ERROR: boom"),
            failure("ERROR: boom"),
            failure("ERROR: boom"),
            Ok(()),
        ]);
        let fetcher = VideoFetcher::new(engine.clone(), 3, Duration::ZERO, "web.archive.org");

        assert!(fetcher
            .fetch("x", &dir.path().join("abc"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(engine.calls(), 3);
    }

    #[tokio::test]
    async fn test_success_without_file_is_absent() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(ScriptedEngine {
            outcomes: Mutex::new(vec![Ok(())].into()),
            calls: Mutex::new(0),
            write_file: false,
        });
        let fetcher = VideoFetcher::new(engine, 3, Duration::ZERO, "web.archive.org");

        assert!(fetcher
            .fetch("x", &dir.path().join("abc"))
            .await
            .unwrap()
            .is_none());
    }

    const ARCHIVED_VIDEO: &str =
        "https://web.archive.org/web/20200101000000/https://v.redd.it/abc";

    #[tokio::test]
    async fn test_archive_refusal_cools_off_before_retry() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![
            failure("ERROR: Unable to download webpage: [Errno 61] Connection refused"),
            Ok(()),
        ]);
        let cooldown = Duration::from_millis(300);
        let fetcher = VideoFetcher::new(engine.clone(), 3, cooldown, "web.archive.org");

        let started = Instant::now();
        let saved = fetcher
            .fetch(ARCHIVED_VIDEO, &dir.path().join("abc"))
            .await
            .unwrap();
        assert!(started.elapsed() >= cooldown);
        assert_eq!(saved, Some(dir.path().join("abc.mp4")));
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn test_archive_refusal_on_last_try_does_not_wait() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![failure("ERROR: [Errno 61] Connection refused")]);
        let fetcher = VideoFetcher::new(engine.clone(), 1, Duration::from_secs(5), "web.archive.org");

        let started = Instant::now();
        let saved = fetcher
            .fetch(ARCHIVED_VIDEO, &dir.path().join("abc"))
            .await
            .unwrap();
        assert!(saved.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_refusal_from_other_host_does_not_wait() {
        let dir = TempDir::new().unwrap();
        let engine = ScriptedEngine::new(vec![
            failure("ERROR: [Errno 61] Connection refused"),
            Ok(()),
        ]);
        let fetcher = VideoFetcher::new(engine.clone(), 3, Duration::from_secs(5), "web.archive.org");

        let started = Instant::now();
        let saved = fetcher
            .fetch("https://v.redd.it/abc", &dir.path().join("abc"))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(saved.is_some());
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(YtDlp::new("/nonexistent/yt-dlp", Duration::from_secs(5)));
        assert!(!engine.is_available().await);

        let fetcher = VideoFetcher::new(engine, 3, Duration::ZERO, "web.archive.org");
        let err = fetcher
            .fetch("https://v.redd.it/abc", &dir.path().join("abc"))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Engine(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_program_reports_exit_status() {
        let engine = YtDlp::new("false", Duration::from_secs(5));
        let err = engine.fetch("x", "/tmp/never.%(ext)s").await.unwrap_err();
        assert!(matches!(err, EngineError::Download(m) if m.contains("exited with")));
    }
}
