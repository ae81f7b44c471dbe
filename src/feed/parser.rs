use feed_rs::parser;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::filter::ItemFields;

/// The feed body could not be understood as RSS, Atom or JSON Feed.
#[derive(Debug, Error)]
#[error("Parse error: {0}")]
pub struct ParseError(#[from] parser::ParseFeedError);

/// Channel-level metadata reported by the feed document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedMeta {
    pub title: Option<String>,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub language: Option<String>,
}

/// One entry of a feed, normalized and carrying its identity hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedItem {
    /// Dedup key within a feed, see [`identity_hash`]
    pub identity_hash: String,
    /// GUID, falling back to the link
    pub native_id: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub description: Option<String>,
    pub content: Option<String>,
    /// Unix seconds
    pub published: Option<i64>,
    /// Unix seconds
    pub updated: Option<i64>,
    pub author_name: Option<String>,
    pub author_email: Option<String>,
    pub categories: Vec<String>,
}

impl NormalizedItem {
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

#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub meta: FeedMeta,
    pub items: Vec<NormalizedItem>,
}

/// Content identity of an item: SHA-256 over title and link only.
///
/// Description and content are deliberately excluded so that an article whose
/// body is edited keeps its identity.
pub fn identity_hash(title: Option<&str>, link: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(title.map(str::trim).unwrap_or("").as_bytes());
    hasher.update(b"\n");
    hasher.update(link.map(str::trim).unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Parse raw feed bytes into metadata and normalized items.
///
/// Either the whole document parses or nothing is returned.
pub fn parse_feed(bytes: &[u8]) -> Result<ParsedFeed, ParseError> {
    let feed = parser::parse(bytes)?;

    let meta = FeedMeta {
        title: feed.title.map(|t| t.content).and_then(non_empty),
        description: feed.description.map(|t| t.content).and_then(non_empty),
        icon: feed
            .icon
            .or(feed.logo)
            .map(|image| image.uri)
            .and_then(non_empty),
        language: feed.language.and_then(non_empty),
    };

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let title = entry.title.map(|t| t.content).and_then(non_empty);
            let link = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .and_then(non_empty);
            let description = entry.summary.map(|s| s.content).and_then(non_empty);
            let content = entry.content.and_then(|c| c.body).and_then(non_empty);
            let author = entry.authors.into_iter().next();
            let categories = entry
                .categories
                .into_iter()
                .filter_map(|c| non_empty(c.term))
                .collect();

            let native_id = non_empty(entry.id)
                .or_else(|| link.clone())
                .unwrap_or_default();

            // Items with neither title nor link would all collapse onto one
            // identity; fall back to the native ID for those.
            let identity = if title.is_none() && link.is_none() {
                identity_hash(None, Some(&native_id))
            } else {
                identity_hash(title.as_deref(), link.as_deref())
            };

            NormalizedItem {
                identity_hash: identity,
                native_id,
                title,
                link,
                description,
                content,
                published: entry.published.map(|dt| dt.timestamp()),
                updated: entry.updated.map(|dt| dt.timestamp()),
                author_name: author.as_ref().and_then(|a| non_empty(a.name.clone())),
                author_email: author.and_then(|a| a.email).and_then(non_empty),
                categories,
            }
        })
        .collect();

    Ok(ParsedFeed { meta, items })
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == s.len() {
        Some(s)
    } else {
        Some(trimmed.to_string())
    }
}
