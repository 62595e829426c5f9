//! The entry points answering one logical request end to end.
//!
//! All controllers follow the same pattern:
//!
//! 1. Derive the [`RequestKey`](crate::types::RequestKey) of the request and go through the
//!    controller's [`CoalescingGroup`](crate::coalescing::CoalescingGroup), so identical
//!    concurrent requests are answered by one computation.
//! 2. Run the expensive step (a remote download, a thumbnail transformation or a page preview)
//!    on a [`ResourceHandler`](crate::handler::ResourceHandler).
//! 3. Serve the resulting content through the [`ContentCache`](crate::caching::ContentCache).
//!
//! Every request records exactly one download of the content it resolves to, no matter whether
//! it was coalesced or served from the cache.

mod download;
mod preview;
mod thumbnail;

pub use download::{DownloadController, DownloadOptions, MediaResponse};
pub use preview::{PreviewController, PreviewResponse};
pub use thumbnail::{ThumbnailController, ThumbnailRequest, ThumbnailResponse};
