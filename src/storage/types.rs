use serde::Serialize;
use thiserror::Error;

use crate::feed::NormalizedItem;
use crate::filter::ItemFields;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with operator-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Database is locked by another process. Stop it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Write Inputs
// ============================================================================

/// Result of registering a source with the feed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertedFeed {
    /// Internal feed ID
    pub id: i64,
    /// True when this call created the record
    pub created: bool,
    /// True when an existing record's URL differed and was replaced
    pub url_changed: bool,
    /// True when an existing record's display name differed and was replaced
    pub name_changed: bool,
}

impl UpsertedFeed {
    /// A "source changed" event: the definition moved or was renamed.
    pub fn source_changed(&self) -> bool {
        self.url_changed || self.name_changed
    }
}

/// Outcome of one fetch attempt as persisted on the feed record.
#[derive(Debug, Clone, Copy)]
pub struct FetchAttempt<'a> {
    pub success: bool,
    /// Unix seconds
    pub at: i64,
    /// Error message for failed attempts
    pub error: Option<&'a str>,
}

/// A normalized item plus the filter decision made on first sight.
#[derive(Debug, Clone, Copy)]
pub struct NewItem<'a> {
    pub item: &'a NormalizedItem,
    pub filtered: bool,
    pub filter_reason: Option<&'a str>,
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for feed queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedDbRow {
    pub id: i64,
    pub external_id: String,
    pub url: String,
    pub name: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub language: Option<String>,
    pub last_success_at: Option<i64>,
    pub last_attempt_at: Option<i64>,
    pub consecutive_failures: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl FeedDbRow {
    pub(crate) fn into_record(self) -> FeedRecord {
        FeedRecord {
            id: self.id,
            external_id: self.external_id,
            url: self.url,
            name: self.name,
            title: self.title,
            description: self.description,
            icon: self.icon,
            language: self.language,
            last_success_at: self.last_success_at,
            last_attempt_at: self.last_attempt_at,
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error,
            created_at: self.created_at,
        }
    }
}

/// Internal row type for item queries (used by sqlx FromRow)
///
/// Categories are stored as a JSON array in a TEXT column.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemDbRow {
    pub id: i64,
    pub feed_id: i64,
    pub identity_hash: String,
    pub native_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub published: Option<i64>,
    pub updated: Option<i64>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub categories: String,
    pub filtered: bool,
    pub filter_reason: Option<String>,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

impl ItemDbRow {
    pub(crate) fn into_record(self) -> ItemRecord {
        let categories = match serde_json::from_str(&self.categories) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(item_id = self.id, error = %e, "Unreadable category list, treating as empty");
                Vec::new()
            }
        };

        ItemRecord {
            id: self.id,
            feed_id: self.feed_id,
            identity_hash: self.identity_hash,
            native_id: self.native_id,
            title: self.title,
            link: self.link,
            description: self.description,
            content: self.content,
            published: self.published,
            updated: self.updated,
            author_name: self.author_name,
            author_email: self.author_email,
            categories,
            filtered: self.filtered,
            filter_reason: self.filter_reason,
            first_seen_at: self.first_seen_at,
            last_seen_at: self.last_seen_at,
        }
    }
}

/// Encode a category list for the `items.categories` column.
pub(crate) fn encode_categories(categories: &[String]) -> String {
    serde_json::to_string(categories).unwrap_or_else(|_| "[]".to_string())
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed record as stored. Mutated only by the ingestion core.
#[derive(Debug, Clone, Serialize)]
pub struct FeedRecord {
    pub id: i64,
    pub external_id: String,
    pub url: String,
    pub name: String,
    /// Title reported by the feed itself
    pub title: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub language: Option<String>,
    /// Unix seconds of the last successful fetch
    pub last_success_at: Option<i64>,
    /// Unix seconds of the last attempt, successful or not
    pub last_attempt_at: Option<i64>,
    /// Number of consecutive failed runs
    pub consecutive_failures: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
}

impl FeedRecord {
    /// Title to show for this feed: the feed's own title, else the display name.
    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.name)
    }
}

/// Stored feed item. `(feed_id, identity_hash)` is unique.
#[derive(Debug, Clone, Serialize)]
pub struct ItemRecord {
    pub id: i64,
    pub feed_id: i64,
    pub identity_hash: String,
    pub native_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    pub published: Option<i64>,
    pub updated: Option<i64>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub categories: Vec<String>,
    pub filtered: bool,
    pub filter_reason: Option<String>,
    pub first_seen_at: i64,
    pub last_seen_at: i64,
}

impl ItemRecord {
    pub fn fields(&self) -> ItemFields<'_> {
        ItemFields {
            title: self.title.as_deref(),
            description: self.description.as_deref(),
            content: self.content.as_deref(),
            author_name: self.author_name.as_deref(),
            author_email: self.author_email.as_deref(),
            categories: &self.categories,
        }
    }
}

/// Per-feed item counts for administrative views.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ItemStats {
    pub total: i64,
    pub admitted: i64,
    pub filtered: i64,
    /// Most recent `last_seen_at` across the feed's items
    pub last_seen_at: Option<i64>,
}
