//! Saved post archiver library.
//!
//! Downloads the media behind a user's saved Reddit posts, falling back to
//! redirects, Wayback Machine captures and cached previews when the original
//! link no longer works, and keeps per-post status so re-runs only pick up
//! what is new or previously failed.

pub mod archiver;
pub mod config;
pub mod constants;
pub mod http;
pub mod posts;
pub mod state;
pub mod wayback;
