//! Shared constants used across the application.

use std::time::Duration;

/// User agent string used for media and archive HTTP requests.
///
/// Media hosts (imgur in particular) serve placeholder pages to obvious bots,
/// so requests look like a regular desktop browser.
pub const ARCHIVAL_USER_AGENT: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:135.0) Gecko/20100101 Firefox/135.0";

/// Host of the Wayback Machine. Connection refusals from it mean it is shedding load.
pub const ARCHIVE_HOST: &str = "web.archive.org";

/// Wayback Machine CDX search endpoint.
pub const WAYBACK_CDX_URL: &str = "https://web.archive.org/cdx/search/cdx";

/// Prefix for snapshot URLs: `{base}/{timestamp}/{original_url}`.
pub const WAYBACK_SNAPSHOT_BASE: &str = "https://web.archive.org/web";

/// Wait imposed after the archive host refuses connections.
pub const ARCHIVE_COOLDOWN: Duration = Duration::from_secs(61);

/// Timeout for the HEAD request used to resolve redirects.
pub const REDIRECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Chunk size for streaming media bodies to disk.
pub const WRITE_CHUNK_SIZE: usize = 1024 * 1024;

/// Number of successful downloads between status file flushes.
pub const DEFAULT_SAVE_EVERY: usize = 10;

/// Name of the status file inside the output directory.
pub const STATUS_FILE_NAME: &str = "db.json";

/// Redirect targets that mean the original media was deleted.
///
/// Imgur replaces removed images with a placeholder instead of returning 404.
pub const DEAD_LINK_TARGETS: &[&str] = &["https://i.imgur.com/removed.png", "https://imgur.com/"];
