//! One ingestion run for one source: fetch, parse, deduplicate, filter, persist.
//!
//! The scheduler only knows the [`Process`] trait; [`FeedProcessor`] is the
//! real pipeline. A run never panics on bad input: every failure ends up in
//! the returned [`ProcessingOutcome`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::feed::{parse_feed, FetchError, Fetcher, NormalizedItem, ParseError};
use crate::sources::SourceDefinition;
use crate::storage::{DatabaseError, FetchAttempt, NewItem, Store};
use crate::util::unix_now;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to register source: {0}")]
    Register(#[source] DatabaseError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Failed to update feed metadata: {0}")]
    Metadata(#[source] DatabaseError),

    #[error("Failed to record fetch outcome: {0}")]
    Record(#[source] DatabaseError),

    #[error("{failed} of {total} item writes failed")]
    ItemWrites { failed: usize, total: usize },
}

impl ProcessError {
    /// Whether this error counts toward the source's failure streak.
    ///
    /// Registration, fetch and parse failures do. A fetch cancelled by
    /// shutdown does not, and neither do partial write failures after a
    /// successful fetch.
    pub fn counts_as_failure(&self) -> bool {
        match self {
            ProcessError::Fetch(FetchError::Cancelled) => false,
            ProcessError::Register(_) | ProcessError::Fetch(_) | ProcessError::Parse(_) => true,
            ProcessError::Metadata(_) | ProcessError::Record(_) | ProcessError::ItemWrites { .. } => {
                false
            }
        }
    }
}

/// Result of one processor run.
#[derive(Debug)]
pub struct ProcessingOutcome {
    pub source_id: String,
    /// Items present in the fetched document
    pub seen: usize,
    pub new: usize,
    /// Already-known items refreshed in place
    pub updated: usize,
    /// New items rejected by the filter
    pub filtered: usize,
    pub item_errors: usize,
    pub error: Option<ProcessError>,
    pub duration: Duration,
    /// Persisted streak after the run, when it could be recorded
    pub failure_streak: Option<i64>,
}

impl ProcessingOutcome {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            seen: 0,
            new: 0,
            updated: 0,
            filtered: 0,
            item_errors: 0,
            error: None,
            duration: Duration::ZERO,
            failure_streak: None,
        }
    }

    pub fn with_error(mut self, error: ProcessError) -> Self {
        self.error = Some(error);
        self
    }

    /// False when the run failed in a way that extends the failure streak.
    pub fn fetch_succeeded(&self) -> bool {
        self.error
            .as_ref()
            .map_or(true, |e| !e.counts_as_failure())
    }
}

/// Summary of re-applying a source's rules to its stored items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RefilterOutcome {
    pub examined: usize,
    pub changed: usize,
}

/// The unit of work the scheduler dispatches.
#[async_trait]
pub trait Process: Send + Sync + 'static {
    async fn process(&self, source: &SourceDefinition, cancel: &CancellationToken)
        -> ProcessingOutcome;
}

enum ItemChange {
    New { filtered: bool },
    Refreshed,
}

/// Fetch → parse → filter → persist pipeline over a [`Store`].
pub struct FeedProcessor {
    fetcher: Fetcher,
    store: Arc<dyn Store>,
}

impl FeedProcessor {
    pub fn new(fetcher: Fetcher, store: Arc<dyn Store>) -> Self {
        Self { fetcher, store }
    }

    /// Register `source` and return its feed id, warning when its URL or
    /// name changed since the last registration.
    pub async fn register(&self, source: &SourceDefinition) -> Result<i64, DatabaseError> {
        let upserted = self
            .store
            .upsert_feed(&source.id, &source.url, &source.name)
            .await?;
        if upserted.created {
            tracing::info!(source = %source.id, feed_id = upserted.id, "Registered new source");
        } else if upserted.source_changed() {
            tracing::warn!(
                source = %source.id,
                url_changed = upserted.url_changed,
                name_changed = upserted.name_changed,
                "Source changed"
            );
        }
        Ok(upserted.id)
    }

    /// Re-evaluate the source's current rules against every stored item.
    ///
    /// Only items whose flag or reason changes are written; seen timestamps
    /// are never touched and nothing is fetched. An unregistered source has
    /// no items and yields an empty outcome.
    pub async fn refilter(&self, source: &SourceDefinition) -> Result<RefilterOutcome, DatabaseError> {
        let Some(feed) = self.store.get_feed(&source.id).await? else {
            return Ok(RefilterOutcome::default());
        };

        let rules = source.rule_set();
        let mut outcome = RefilterOutcome::default();
        for item in self.store.list_items(feed.id).await? {
            outcome.examined += 1;
            let verdict = rules.evaluate(&item.fields());
            if verdict.filtered() == item.filtered && verdict.reason == item.filter_reason {
                continue;
            }
            self.store
                .update_filter_outcome(item.id, verdict.filtered(), verdict.reason.as_deref())
                .await?;
            outcome.changed += 1;
        }

        tracing::info!(
            source = %source.id,
            examined = outcome.examined,
            changed = outcome.changed,
            "Re-filtered stored items"
        );
        Ok(outcome)
    }

    async fn run(
        &self,
        source: &SourceDefinition,
        cancel: &CancellationToken,
        outcome: &mut ProcessingOutcome,
    ) -> Result<(), ProcessError> {
        let feed_id = self.register(source).await.map_err(ProcessError::Register)?;

        let parsed = match self.fetch_and_parse(source, cancel).await {
            Ok(parsed) => parsed,
            Err(e) => {
                if e.counts_as_failure() {
                    outcome.failure_streak = self.record_failure(feed_id, &e).await;
                }
                return Err(e);
            }
        };

        let now = unix_now();
        for item in &parsed.items {
            outcome.seen += 1;
            match self.store_item(feed_id, source, item, now).await {
                Ok(ItemChange::New { filtered }) => {
                    outcome.new += 1;
                    if filtered {
                        outcome.filtered += 1;
                    }
                }
                Ok(ItemChange::Refreshed) => outcome.updated += 1,
                Err(e) => {
                    outcome.item_errors += 1;
                    tracing::warn!(
                        source = %source.id,
                        item = %item.native_id,
                        error = %e,
                        "Failed to store item"
                    );
                }
            }
        }

        let metadata_result = self.store.update_feed_metadata(feed_id, &parsed.meta).await;

        let streak = self
            .store
            .record_fetch_outcome(
                feed_id,
                &FetchAttempt {
                    success: true,
                    at: now,
                    error: None,
                },
            )
            .await
            .map_err(ProcessError::Record)?;
        outcome.failure_streak = Some(streak);

        metadata_result.map_err(ProcessError::Metadata)?;
        if outcome.item_errors > 0 {
            return Err(ProcessError::ItemWrites {
                failed: outcome.item_errors,
                total: outcome.seen,
            });
        }
        Ok(())
    }

    async fn fetch_and_parse(
        &self,
        source: &SourceDefinition,
        cancel: &CancellationToken,
    ) -> Result<crate::feed::ParsedFeed, ProcessError> {
        let bytes = self.fetcher.fetch(&source.url, cancel).await?;
        tracing::debug!(source = %source.id, bytes = bytes.len(), "Fetched source");
        Ok(parse_feed(&bytes)?)
    }

    async fn store_item(
        &self,
        feed_id: i64,
        source: &SourceDefinition,
        item: &NormalizedItem,
        now: i64,
    ) -> Result<ItemChange, DatabaseError> {
        // Known items keep their original filter decision
        if let Some(existing) = self.store.find_item(feed_id, &item.identity_hash).await? {
            self.store.refresh_item(existing.id, item, now).await?;
            return Ok(ItemChange::Refreshed);
        }

        let verdict = source.rule_set().evaluate(&item.fields());
        let is_new = self
            .store
            .upsert_item(
                feed_id,
                &NewItem {
                    item,
                    filtered: verdict.filtered(),
                    filter_reason: verdict.reason.as_deref(),
                },
                now,
            )
            .await?;

        Ok(if is_new {
            ItemChange::New {
                filtered: verdict.filtered(),
            }
        } else {
            ItemChange::Refreshed
        })
    }

    async fn record_failure(&self, feed_id: i64, error: &ProcessError) -> Option<i64> {
        let message = error.to_string();
        let attempt = FetchAttempt {
            success: false,
            at: unix_now(),
            error: Some(&message),
        };
        match self.store.record_fetch_outcome(feed_id, &attempt).await {
            Ok(streak) => Some(streak),
            Err(e) => {
                tracing::warn!(feed_id, error = %e, "Failed to record fetch failure");
                None
            }
        }
    }
}

#[async_trait]
impl Process for FeedProcessor {
    async fn process(
        &self,
        source: &SourceDefinition,
        cancel: &CancellationToken,
    ) -> ProcessingOutcome {
        let started = Instant::now();
        let mut outcome = ProcessingOutcome::new(source.id.clone());
        if let Err(e) = self.run(source, cancel, &mut outcome).await {
            outcome.error = Some(e);
        }
        outcome.duration = started.elapsed();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FetchConfig;
    use crate::filter::{Action, Field, FilterRule, MatchMode, NO_INCLUDE_MATCHED};
    use crate::storage::{Database, FeedStore, ItemStore};
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn rss(items: &[(&str, &str, &str)]) -> String {
        let body: String = items
            .iter()
            .map(|(title, link, description)| {
                format!(
                    "<item><title>{}</title><link>{}</link><guid>{}</guid><description>{}</description></item>",
                    title, link, link, description
                )
            })
            .collect();
        format!(
            r#"<?xml version="1.0"?><rss version="2.0"><channel><title>Test Feed</title><link>https://example.com</link><description>Feed</description>{}</channel></rss>"#,
            body
        )
    }

    async fn setup(timeout_secs: u64) -> (FeedProcessor, Arc<Database>) {
        let db = Arc::new(Database::open(":memory:").await.unwrap());
        let fetcher = Fetcher::new(&FetchConfig {
            timeout_secs,
            ..FetchConfig::default()
        })
        .unwrap();
        let processor = FeedProcessor::new(fetcher, db.clone());
        (processor, db)
    }

    async fn serve(server: &MockServer, body: String) {
        server.reset().await;
        Mock::given(method("GET"))
            .and(path("/feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    fn source(server: &MockServer) -> SourceDefinition {
        SourceDefinition::new("blog", "Blog", format!("{}/feed", server.uri()))
    }

    fn exclude_ads() -> Vec<FilterRule> {
        vec![FilterRule {
            field: Field::Title,
            mode: MatchMode::Substring,
            pattern: "ad".to_string(),
            case_sensitive: false,
            action: Action::Exclude,
        }]
    }

    #[tokio::test]
    async fn test_first_run_stores_and_filters_items() {
        let server = MockServer::start().await;
        serve(
            &server,
            rss(&[
                ("Ad: buy now", "https://example.com/1", "spam"),
                ("Report", "https://example.com/2", "news"),
            ]),
        )
        .await;
        let (processor, db) = setup(5).await;
        let source = source(&server).with_rules(exclude_ads()).unwrap();

        let outcome = processor.process(&source, &CancellationToken::new()).await;
        assert!(outcome.error.is_none(), "{:?}", outcome.error);
        assert_eq!(outcome.seen, 2);
        assert_eq!(outcome.new, 2);
        assert_eq!(outcome.filtered, 1);
        assert_eq!(outcome.failure_streak, Some(0));

        let feed = db.get_feed("blog").await.unwrap().unwrap();
        assert_eq!(feed.title.as_deref(), Some("Test Feed"));
        assert!(feed.last_success_at.is_some());

        let items = db.list_items(feed.id).await.unwrap();
        let ad = items.iter().find(|i| i.title.as_deref() == Some("Ad: buy now")).unwrap();
        assert!(ad.filtered);
        assert!(ad.filter_reason.as_deref().unwrap().contains("title"));
        let report = items.iter().find(|i| i.title.as_deref() == Some("Report")).unwrap();
        assert!(!report.filtered);
        assert_eq!(report.filter_reason, None);
    }

    #[tokio::test]
    async fn test_identical_rerun_creates_nothing() {
        let server = MockServer::start().await;
        serve(&server, rss(&[("One", "https://example.com/1", "a")])).await;
        let (processor, db) = setup(5).await;
        let source = source(&server).with_rules(exclude_ads()).unwrap();

        processor.process(&source, &CancellationToken::new()).await;
        let feed = db.get_feed("blog").await.unwrap().unwrap();
        let before = db.list_items(feed.id).await.unwrap();

        let outcome = processor.process(&source, &CancellationToken::new()).await;
        assert_eq!(outcome.new, 0);
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.filtered, 0);

        let after = db.list_items(feed.id).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].filtered, before[0].filtered);
        assert_eq!(after[0].first_seen_at, before[0].first_seen_at);
    }

    #[tokio::test]
    async fn test_description_change_updates_in_place() {
        let server = MockServer::start().await;
        serve(&server, rss(&[("One", "https://example.com/1", "old body")])).await;
        let (processor, db) = setup(5).await;
        let source = source(&server);

        processor.process(&source, &CancellationToken::new()).await;

        serve(&server, rss(&[("One", "https://example.com/1", "new body")])).await;
        // Rules added now must not apply to the already-known item
        let source = source.with_rules(vec![FilterRule {
            field: Field::Description,
            mode: MatchMode::Substring,
            pattern: "new".to_string(),
            case_sensitive: false,
            action: Action::Exclude,
        }])
        .unwrap();
        let outcome = processor.process(&source, &CancellationToken::new()).await;
        assert_eq!(outcome.new, 0);
        assert_eq!(outcome.updated, 1);

        let feed = db.get_feed("blog").await.unwrap().unwrap();
        let items = db.list_items(feed.id).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].description.as_deref(), Some("new body"));
        assert!(!items[0].filtered);
    }

    #[tokio::test]
    async fn test_timeout_increments_streak_once_and_keeps_items() {
        let server = MockServer::start().await;
        serve(&server, rss(&[("One", "https://example.com/1", "a")])).await;
        let (processor, db) = setup(1).await;
        let source = source(&server);
        processor.process(&source, &CancellationToken::new()).await;

        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let outcome = processor.process(&source, &CancellationToken::new()).await;
        assert!(matches!(
            outcome.error,
            Some(ProcessError::Fetch(FetchError::Timeout))
        ));
        assert!(!outcome.fetch_succeeded());
        assert_eq!(outcome.failure_streak, Some(1));

        let feed = db.get_feed("blog").await.unwrap().unwrap();
        assert_eq!(feed.consecutive_failures, 1);
        assert!(feed.last_error.is_some());
        assert_eq!(db.list_items(feed.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_persists_no_items() {
        let server = MockServer::start().await;
        serve(&server, "this is not a feed".to_string()).await;
        let (processor, db) = setup(5).await;

        let outcome = processor
            .process(&source(&server), &CancellationToken::new())
            .await;
        assert!(matches!(outcome.error, Some(ProcessError::Parse(_))));
        assert_eq!(outcome.seen, 0);

        let feed = db.get_feed("blog").await.unwrap().unwrap();
        assert_eq!(feed.consecutive_failures, 1);
        assert!(feed.last_success_at.is_none());
        assert!(db.list_items(feed.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_resets_streak() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let (processor, db) = setup(5).await;
        let source = source(&server);

        processor.process(&source, &CancellationToken::new()).await;
        let outcome = processor.process(&source, &CancellationToken::new()).await;
        assert_eq!(outcome.failure_streak, Some(2));

        serve(&server, rss(&[("One", "https://example.com/1", "a")])).await;
        let outcome = processor.process(&source, &CancellationToken::new()).await;
        assert!(outcome.fetch_succeeded());
        assert_eq!(outcome.failure_streak, Some(0));
        let feed = db.get_feed("blog").await.unwrap().unwrap();
        assert_eq!(feed.last_error, None);
    }

    #[tokio::test]
    async fn test_cancelled_fetch_does_not_count_as_failure() {
        let server = MockServer::start().await;
        serve(&server, rss(&[])).await;
        let (processor, db) = setup(5).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = processor.process(&source(&server), &cancel).await;
        assert!(matches!(
            outcome.error,
            Some(ProcessError::Fetch(FetchError::Cancelled))
        ));
        assert!(outcome.fetch_succeeded());
        let feed = db.get_feed("blog").await.unwrap().unwrap();
        assert_eq!(feed.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_refilter_updates_flags_without_fetching() {
        let server = MockServer::start().await;
        serve(
            &server,
            rss(&[
                ("Rust news", "https://example.com/1", "a"),
                ("Cooking", "https://example.com/2", "b"),
            ]),
        )
        .await;
        let (processor, db) = setup(5).await;
        let source = source(&server);
        processor.process(&source, &CancellationToken::new()).await;

        let feed = db.get_feed("blog").await.unwrap().unwrap();
        let before = db.list_items(feed.id).await.unwrap();

        // Any request after this point fails the test
        server.reset().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let source = source
            .with_rules(vec![FilterRule {
                field: Field::Title,
                mode: MatchMode::Pattern,
                pattern: "^rust".to_string(),
                case_sensitive: false,
                action: Action::Include,
            }])
            .unwrap();
        let outcome = processor.refilter(&source).await.unwrap();
        assert_eq!(outcome, RefilterOutcome { examined: 2, changed: 1 });

        let after = db.list_items(feed.id).await.unwrap();
        let cooking = after.iter().find(|i| i.title.as_deref() == Some("Cooking")).unwrap();
        assert!(cooking.filtered);
        assert_eq!(cooking.filter_reason.as_deref(), Some(NO_INCLUDE_MATCHED));
        for (old, new) in before.iter().zip(after.iter()) {
            assert_eq!(old.id, new.id);
            assert_eq!(old.first_seen_at, new.first_seen_at);
            assert_eq!(old.last_seen_at, new.last_seen_at);
        }

        // Running again changes nothing
        let again = processor.refilter(&source).await.unwrap();
        assert_eq!(again.changed, 0);
    }

    #[tokio::test]
    async fn test_refilter_unregistered_source_is_empty() {
        let (processor, _db) = setup(5).await;
        let source = SourceDefinition::new("ghost", "Ghost", "https://example.com/feed");
        let outcome = processor.refilter(&source).await.unwrap();
        assert_eq!(outcome, RefilterOutcome::default());
    }
}
