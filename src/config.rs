use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::archiver::classify::SourceTables;
use crate::constants::{
    ARCHIVE_COOLDOWN, ARCHIVE_HOST, DEFAULT_SAVE_EVERY, REDIRECT_TIMEOUT, STATUS_FILE_NAME,
    WAYBACK_CDX_URL, WAYBACK_SNAPSHOT_BASE,
};
use crate::http::HttpSettings;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as number: {source}")]
    ParseFloat {
        name: String,
        #[source]
        source: std::num::ParseFloatError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
    #[error("failed to read sources file {}: {message}", path.display())]
    SourcesFile { path: PathBuf, message: String },
}

/// Application configuration.
///
/// Tunables come from environment variables; `output_dir` and `skip_failed`
/// are filled in from the command line by `main`.
#[derive(Debug, Clone)]
pub struct Config {
    // Output
    pub output_dir: PathBuf,
    pub skip_failed: bool,
    pub save_every: usize,

    // HTTP
    pub http_max_retries: u32,
    pub http_timeout: Duration,
    pub http_backoff_factor: f64,
    pub redirect_timeout: Duration,
    pub archive_cooldown: Duration,

    // Wayback Machine
    pub wayback_cdx_url: String,
    pub wayback_snapshot_base: String,
    pub wayback_max_snapshots: usize,

    // Video extraction
    pub yt_dlp_path: String,
    pub video_max_tries: u32,
    pub video_timeout: Duration,

    // Classifier
    pub sources_file: Option<PathBuf>,

    // Logging
    pub log_dir: PathBuf,
    pub log_format: LogFormat,

    // Reddit API
    pub reddit_api_base: String,
    pub reddit_auth_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human readable console output
    Pretty,
    /// One JSON object per line
    Json,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable is present but invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Output
            output_dir: PathBuf::from(env_or_default("OUTPUT_DIR", ".")),
            skip_failed: parse_env_bool("SKIP_FAILED", false)?,
            save_every: parse_env_usize("SAVE_EVERY", DEFAULT_SAVE_EVERY)?,

            // HTTP
            http_max_retries: parse_env_u32("HTTP_MAX_RETRIES", 5)?,
            http_timeout: Duration::from_secs(parse_env_u64("HTTP_TIMEOUT_SECS", 30)?),
            http_backoff_factor: parse_env_f64("HTTP_BACKOFF_FACTOR", 0.5)?,
            redirect_timeout: Duration::from_secs(parse_env_u64(
                "REDIRECT_TIMEOUT_SECS",
                REDIRECT_TIMEOUT.as_secs(),
            )?),
            archive_cooldown: Duration::from_secs(parse_env_u64(
                "ARCHIVE_COOLDOWN_SECS",
                ARCHIVE_COOLDOWN.as_secs(),
            )?),

            // Wayback Machine
            wayback_cdx_url: env_or_default("WAYBACK_CDX_URL", WAYBACK_CDX_URL),
            wayback_snapshot_base: env_or_default("WAYBACK_SNAPSHOT_BASE", WAYBACK_SNAPSHOT_BASE),
            wayback_max_snapshots: parse_env_usize("WAYBACK_MAX_SNAPSHOTS", 3)?,

            // Video extraction
            yt_dlp_path: env_or_default("YT_DLP_PATH", "yt-dlp"),
            video_max_tries: parse_env_u32("VIDEO_MAX_TRIES", 3)?,
            video_timeout: Duration::from_secs(parse_env_u64("VIDEO_TIMEOUT_SECS", 1800)?),

            // Classifier
            sources_file: optional_env("SOURCES_FILE").map(PathBuf::from),

            // Logging
            log_dir: PathBuf::from(env_or_default("LOG_DIR", "logs")),
            log_format: parse_log_format(&env_or_default("LOG_FORMAT", "pretty"))?,

            // Reddit API
            reddit_api_base: env_or_default("REDDIT_API_BASE", "https://oauth.reddit.com"),
            reddit_auth_url: env_or_default(
                "REDDIT_AUTH_URL",
                "https://www.reddit.com/api/v1/access_token",
            ),
        })
    }

    /// Configuration suitable for tests: no backoff, no cooldown, no real hosts.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            skip_failed: false,
            save_every: DEFAULT_SAVE_EVERY,
            http_max_retries: 2,
            http_timeout: Duration::from_secs(5),
            http_backoff_factor: 0.0,
            redirect_timeout: Duration::from_secs(5),
            archive_cooldown: Duration::ZERO,
            wayback_cdx_url: "http://127.0.0.1:9/cdx/search/cdx".to_string(),
            wayback_snapshot_base: "http://127.0.0.1:9/web".to_string(),
            wayback_max_snapshots: 3,
            yt_dlp_path: "yt-dlp".to_string(),
            video_max_tries: 3,
            video_timeout: Duration::from_secs(30),
            sources_file: None,
            log_dir: PathBuf::from("logs"),
            log_format: LogFormat::Pretty,
            reddit_api_base: "http://127.0.0.1:9".to_string(),
            reddit_auth_url: "http://127.0.0.1:9/api/v1/access_token".to_string(),
        }
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.http_max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                name: "HTTP_MAX_RETRIES".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.video_max_tries == 0 {
            return Err(ConfigError::InvalidValue {
                name: "VIDEO_MAX_TRIES".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.save_every == 0 {
            return Err(ConfigError::InvalidValue {
                name: "SAVE_EVERY".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !self.http_backoff_factor.is_finite() || self.http_backoff_factor < 0.0 {
            return Err(ConfigError::InvalidValue {
                name: "HTTP_BACKOFF_FACTOR".to_string(),
                message: "must be a non-negative number".to_string(),
            });
        }
        for (name, value) in [
            ("WAYBACK_CDX_URL", &self.wayback_cdx_url),
            ("WAYBACK_SNAPSHOT_BASE", &self.wayback_snapshot_base),
            ("REDDIT_API_BASE", &self.reddit_api_base),
            ("REDDIT_AUTH_URL", &self.reddit_auth_url),
        ] {
            if url::Url::parse(value).is_err() {
                return Err(ConfigError::InvalidValue {
                    name: name.to_string(),
                    message: format!("not a valid URL: '{value}'"),
                });
            }
        }
        Ok(())
    }

    /// Path of the durable status file.
    #[must_use]
    pub fn status_path(&self) -> PathBuf {
        self.output_dir.join(STATUS_FILE_NAME)
    }

    /// Settings for the retrying HTTP client.
    #[must_use]
    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            max_tries: self.http_max_retries,
            timeout: self.http_timeout,
            backoff_factor: self.http_backoff_factor,
            archive_cooldown: self.archive_cooldown,
            archive_host: url::Url::parse(&self.wayback_snapshot_base)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string))
                .unwrap_or_else(|| ARCHIVE_HOST.to_string()),
        }
    }

    /// Domain tables for the classifier, from `SOURCES_FILE` when set.
    ///
    /// # Errors
    ///
    /// Returns an error if the sources file cannot be read or parsed.
    pub fn source_tables(&self) -> Result<SourceTables, ConfigError> {
        match &self.sources_file {
            Some(path) => load_source_tables(path),
            None => Ok(SourceTables::default()),
        }
    }
}

fn load_source_tables(path: &Path) -> Result<SourceTables, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::SourcesFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    SourceTables::from_toml(&content).map_err(|e| ConfigError::SourcesFile {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_f64(name: &str, default: f64) -> Result<f64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseFloat {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

fn parse_log_format(value: &str) -> Result<LogFormat, ConfigError> {
    match value.to_lowercase().as_str() {
        "pretty" | "text" => Ok(LogFormat::Pretty),
        "json" | "structured" => Ok(LogFormat::Json),
        _ => Err(ConfigError::InvalidValue {
            name: "LOG_FORMAT".to_string(),
            message: format!("must be 'pretty' or 'json', got '{value}'"),
        }),
    }
}
