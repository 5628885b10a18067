use std::path::{Path, PathBuf};
use std::pin::pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::downloader::Downloader;
use super::image::with_extension;
use super::sanitize_path_component;
use crate::config::Config;
use crate::posts::csv::load_saved_posts_csv;
use crate::posts::{
    items_by_fullname, resolve_crosspost, saved_items, to_post, Post, PostSource, SourceItem,
};
use crate::state::{ItemStatus, StatusStore};

/// Totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub downloaded: usize,
    pub failed: usize,
    /// Newly marked as skipped this run.
    pub skipped: usize,
    /// Left alone because of a status from an earlier run.
    pub already_handled: usize,
    /// Ids in the status store after the run.
    pub total_known: usize,
    pub interrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Downloaded,
    Failed,
    Skipped,
    AlreadyHandled,
}

/// Metadata written next to a downloaded post.
#[derive(Debug, Serialize)]
struct Sidecar<'a> {
    id: &'a str,
    sub: &'a str,
    title: &'a str,
    author: &'a str,
    date: i64,
    files: Vec<String>,
}

/// Sequential archive loop over a stream of saved items.
pub struct ArchiveWorker {
    config: Config,
    source: Arc<dyn PostSource>,
    downloader: Downloader,
    store: StatusStore,
    shutdown: CancellationToken,
    added: usize,
}

impl ArchiveWorker {
    #[must_use]
    pub fn new(
        config: Config,
        source: Arc<dyn PostSource>,
        downloader: Downloader,
        store: StatusStore,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            source,
            downloader,
            store,
            shutdown,
            added: 0,
        }
    }

    #[must_use]
    pub fn store(&self) -> &StatusStore {
        &self.store
    }

    /// Posts downloaded by this worker so far.
    #[must_use]
    pub fn added(&self) -> usize {
        self.added
    }

    /// Archive every saved item of the account.
    ///
    /// # Errors
    ///
    /// See [`ArchiveWorker::run`].
    pub async fn download_saved(&mut self, skip_failed: bool) -> Result<RunSummary> {
        let items = saved_items(Arc::clone(&self.source));
        self.run(items, skip_failed).await
    }

    /// Archive the posts listed in a data-export CSV.
    ///
    /// # Errors
    ///
    /// Returns an error if the CSV cannot be read, otherwise see [`ArchiveWorker::run`].
    pub async fn download_csv(&mut self, path: &Path, skip_failed: bool) -> Result<RunSummary> {
        let fullnames = load_saved_posts_csv(path).await?;
        info!(count = fullnames.len(), path = %path.display(), "Loaded saved posts from CSV");
        let items = items_by_fullname(Arc::clone(&self.source), fullnames);
        self.run(items, skip_failed).await
    }

    /// Process items one at a time until the stream ends or shutdown is requested.
    ///
    /// The status store is saved on the way out in every case.
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream listing fails, a file cannot be
    /// written, the video engine cannot run, or the store cannot be saved.
    pub async fn run<S>(&mut self, items: S, skip_failed: bool) -> Result<RunSummary>
    where
        S: Stream<Item = Result<SourceItem>>,
    {
        let mut summary = RunSummary::default();
        let result = self.process_all(items, skip_failed, &mut summary).await;

        let saved = self.store.save();
        summary.total_known = self.store.len();

        match (result, saved) {
            (Ok(()), Ok(())) => {
                info!(
                    downloaded = summary.downloaded,
                    failed = summary.failed,
                    skipped = summary.skipped,
                    already_handled = summary.already_handled,
                    total = summary.total_known,
                    interrupted = summary.interrupted,
                    "Run finished"
                );
                Ok(summary)
            }
            (Ok(()), Err(e)) => Err(e),
            (Err(e), saved) => {
                if let Err(save_error) = saved {
                    error!("Failed to save status after error: {save_error:#}");
                }
                Err(e)
            }
        }
    }

    async fn process_all<S>(
        &mut self,
        items: S,
        skip_failed: bool,
        summary: &mut RunSummary,
    ) -> Result<()>
    where
        S: Stream<Item = Result<SourceItem>>,
    {
        let mut items = pin!(items);
        let shutdown = self.shutdown.clone();

        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => None,
                next = items.next() => next,
            };
            if shutdown.is_cancelled() {
                info!("Shutdown requested, stopping");
                summary.interrupted = true;
                return Ok(());
            }
            let Some(item) = next else {
                return Ok(());
            };
            let item = item.context("Failed to fetch saved items")?;
            let id = item.id().to_string();

            let outcome = tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    warn!(id = %id, "Shutdown requested, abandoning in-flight post");
                    summary.interrupted = true;
                    return Ok(());
                }
                outcome = self.process_item(item, skip_failed) => outcome?,
            };

            match outcome {
                Outcome::Downloaded => summary.downloaded += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::Skipped => summary.skipped += 1,
                Outcome::AlreadyHandled => summary.already_handled += 1,
            }
        }
    }

    async fn process_item(&mut self, item: SourceItem, skip_failed: bool) -> Result<Outcome> {
        let raw = match item {
            SourceItem::Post(raw) => *raw,
            SourceItem::Other { id, kind } => {
                if let Some(reason) = self.store.skip_reason(&id, skip_failed) {
                    info!(id = %id, kind = %kind, %reason, "Skipping item");
                    return Ok(Outcome::AlreadyHandled);
                }
                info!(id = %id, kind = %kind, "Skipping - not a post");
                self.store.record(&id, ItemStatus::Skipped);
                return Ok(Outcome::Skipped);
            }
        };

        if let Some(reason) = self.store.skip_reason(&raw.id, skip_failed) {
            info!(post_id = %raw.id, sub = %raw.subreddit, %reason, "Skipping post");
            return Ok(Outcome::AlreadyHandled);
        }

        debug!(
            post_id = %raw.id,
            sub = %raw.subreddit,
            permalink = raw.permalink.as_deref().unwrap_or_default(),
            "Parsing submission"
        );
        let original_id = raw.id.clone();
        let resolved = match resolve_crosspost(self.source.as_ref(), raw.clone()).await {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(post_id = %original_id, "Failed to resolve crosspost, using the post itself: {e:#}");
                raw
            }
        };

        if resolved.id != original_id {
            if let Some(reason) = self.store.skip_reason(&resolved.id, skip_failed) {
                if let Some(status) = self.store.get(&resolved.id) {
                    self.store.record(&original_id, status);
                }
                info!(
                    post_id = %original_id,
                    resolved_id = %resolved.id,
                    %reason,
                    "Skipping crosspost"
                );
                return Ok(Outcome::AlreadyHandled);
            }
        }

        let post = to_post(&resolved, self.downloader.tables());
        debug!(post = %post, "Built post");
        let ids = status_ids(&original_id, &post.id);

        if !post.is_good() {
            info!(post_id = %post.id, sub = %post.collection, "Skipping post - no valid data to work with");
            self.record_all(&ids, ItemStatus::Skipped);
            return Ok(Outcome::Skipped);
        }

        debug!(post_id = %post.id, sub = %post.collection, "Attempting to download post");
        let collection_dir = self
            .config
            .output_dir
            .join(sanitize_path_component(&post.collection));
        tokio::fs::create_dir_all(&collection_dir)
            .await
            .with_context(|| format!("Failed to create directory: {}", collection_dir.display()))?;
        let target = collection_dir.join(sanitize_path_component(&post.id));

        let files = self
            .downloader
            .download(&post, &target)
            .await
            .with_context(|| format!("Failed to download post {}", post.id))?;

        if files.is_empty() {
            self.record_all(&ids, ItemStatus::Failed);
            info!(
                post_id = %post.id,
                sub = %post.collection,
                total = self.store.len(),
                added = self.added,
                "❌ Failed to download post"
            );
            return Ok(Outcome::Failed);
        }

        write_sidecar(&post, &files, &collection_dir, &target).await?;
        self.record_all(&ids, ItemStatus::Downloaded);
        self.added += 1;
        info!(
            post_id = %post.id,
            sub = %post.collection,
            files = files.len(),
            total = self.store.len(),
            added = self.added,
            "✅ Downloaded post"
        );

        if self.added % self.config.save_every.max(1) == 0 {
            self.store.save()?;
        }
        Ok(Outcome::Downloaded)
    }

    fn record_all(&mut self, ids: &[String], status: ItemStatus) {
        for id in ids {
            self.store.record(id, status);
        }
    }
}

/// Ids a post's outcome is recorded under: the saved id and, for a
/// crosspost, the id of the post it points to.
fn status_ids(original_id: &str, resolved_id: &str) -> Vec<String> {
    if original_id == resolved_id {
        vec![original_id.to_string()]
    } else {
        vec![original_id.to_string(), resolved_id.to_string()]
    }
}

/// Write `<target>.json` describing `post`, with `files` relative to `collection_dir`.
async fn write_sidecar(
    post: &Post,
    files: &[PathBuf],
    collection_dir: &Path,
    target: &Path,
) -> Result<PathBuf> {
    let sidecar = Sidecar {
        id: &post.id,
        sub: &post.collection,
        title: &post.title,
        author: &post.author,
        date: post.date,
        files: files
            .iter()
            .map(|file| {
                file.strip_prefix(collection_dir)
                    .unwrap_or(file)
                    .to_string_lossy()
                    .into_owned()
            })
            .collect(),
    };

    let path = with_extension(target, "json");
    let json = serde_json::to_vec_pretty(&sidecar).context("Failed to serialize metadata")?;
    tokio::fs::write(&path, json)
        .await
        .with_context(|| format!("Failed to write metadata: {}", path.display()))?;
    Ok(path)
}
