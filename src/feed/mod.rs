//! Feed I/O for the ingestion pipeline.
//!
//! - [`fetcher`] - HTTP retrieval with timeout, identifying headers and size limits
//! - [`parser`] - RSS/Atom parsing via `feed-rs` into normalized items with identity hashes
//! - [`render`] - RSS 2.0 serialisation of stored items for the read API

mod fetcher;
mod parser;
mod render;

pub use fetcher::{FetchError, Fetcher};
pub use parser::{identity_hash, parse_feed, FeedMeta, NormalizedItem, ParseError, ParsedFeed};
pub use render::{render_rss, RenderError};
