//! Saved posts: the domain model and the platform collaborator that supplies them.

pub mod csv;
mod model;
pub mod reddit;
mod source;

pub use model::{Post, REMOVED_SENTINELS};
pub use source::{
    items_by_fullname, resolve_crosspost, saved_items, to_post, GalleryData, GalleryItem,
    MediaMetadata, MediaSource, Page, PostSource, RawPost, SourceItem,
};
