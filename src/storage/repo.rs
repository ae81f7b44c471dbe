//! Repository contracts consumed by the ingestion core.
//!
//! The processor, scheduler and service only see these traits; [`Database`]
//! is the SQLite implementation.
//!
//! [`Database`]: super::Database

use async_trait::async_trait;

use super::types::{
    DatabaseError, FeedRecord, FetchAttempt, ItemRecord, ItemStats, NewItem, UpsertedFeed,
};
use crate::feed::{FeedMeta, NormalizedItem};

/// Feed record operations.
#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Idempotently register a source keyed by its external ID.
    ///
    /// Creates the record on first sight. An existing record whose URL or
    /// name differs is updated in place and the change is reported.
    async fn upsert_feed(
        &self,
        external_id: &str,
        url: &str,
        name: &str,
    ) -> Result<UpsertedFeed, DatabaseError>;

    /// Replace the metadata reported by the feed document.
    async fn update_feed_metadata(&self, feed_id: i64, meta: &FeedMeta)
        -> Result<(), DatabaseError>;

    /// Persist a fetch attempt and return the resulting failure streak.
    ///
    /// Success resets the streak to zero and clears the last error; failure
    /// increments it by one.
    async fn record_fetch_outcome(
        &self,
        feed_id: i64,
        attempt: &FetchAttempt<'_>,
    ) -> Result<i64, DatabaseError>;

    async fn get_feed(&self, external_id: &str) -> Result<Option<FeedRecord>, DatabaseError>;

    async fn list_feeds(&self) -> Result<Vec<FeedRecord>, DatabaseError>;
}

/// Item operations. Items are keyed by `(feed_id, identity_hash)`.
#[async_trait]
pub trait ItemStore: Send + Sync {
    async fn find_item(
        &self,
        feed_id: i64,
        identity_hash: &str,
    ) -> Result<Option<ItemRecord>, DatabaseError>;

    /// Insert an item, or refresh it when the identity already exists.
    ///
    /// Returns `true` when a new row was created. On conflict the stored
    /// filter decision and `first_seen_at` are kept.
    async fn upsert_item(
        &self,
        feed_id: i64,
        item: &NewItem<'_>,
        seen_at: i64,
    ) -> Result<bool, DatabaseError>;

    /// Refresh last-seen time and mutable fields of an existing item.
    async fn refresh_item(
        &self,
        item_id: i64,
        item: &NormalizedItem,
        seen_at: i64,
    ) -> Result<(), DatabaseError>;

    /// All items of a feed, newest first.
    async fn list_items(&self, feed_id: i64) -> Result<Vec<ItemRecord>, DatabaseError>;

    async fn update_filter_outcome(
        &self,
        item_id: i64,
        filtered: bool,
        reason: Option<&str>,
    ) -> Result<(), DatabaseError>;

    async fn item_stats(&self, feed_id: i64) -> Result<ItemStats, DatabaseError>;
}

/// Everything the ingestion core needs from storage.
pub trait Store: FeedStore + ItemStore {}

impl<T: FeedStore + ItemStore> Store for T {}
