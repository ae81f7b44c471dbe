use async_trait::async_trait;

use super::repo::FeedStore;
use super::schema::Database;
use super::types::{DatabaseError, FeedDbRow, FeedRecord, FetchAttempt, UpsertedFeed};
use crate::feed::FeedMeta;

const FEED_COLUMNS: &str = "id, external_id, url, name, title, description, icon, language, \
     last_success_at, last_attempt_at, consecutive_failures, last_error, created_at";

#[async_trait]
impl FeedStore for Database {
    async fn upsert_feed(
        &self,
        external_id: &str,
        url: &str,
        name: &str,
    ) -> Result<UpsertedFeed, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64, String, String)> =
            sqlx::query_as("SELECT id, url, name FROM feeds WHERE external_id = ?")
                .bind(external_id)
                .fetch_optional(&mut *tx)
                .await?;

        let upserted = match existing {
            None => {
                let now = chrono::Utc::now().timestamp();
                let (id,): (i64,) = sqlx::query_as(
                    "INSERT INTO feeds (external_id, url, name, created_at) VALUES (?, ?, ?, ?)
                     RETURNING id",
                )
                .bind(external_id)
                .bind(url)
                .bind(name)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                UpsertedFeed {
                    id,
                    created: true,
                    url_changed: false,
                    name_changed: false,
                }
            }
            Some((id, old_url, old_name)) => {
                let url_changed = old_url != url;
                let name_changed = old_name != name;
                if url_changed || name_changed {
                    sqlx::query("UPDATE feeds SET url = ?, name = ? WHERE id = ?")
                        .bind(url)
                        .bind(name)
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                UpsertedFeed {
                    id,
                    created: false,
                    url_changed,
                    name_changed,
                }
            }
        };

        tx.commit().await?;
        Ok(upserted)
    }

    async fn update_feed_metadata(
        &self,
        feed_id: i64,
        meta: &FeedMeta,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE feeds SET title = ?, description = ?, icon = ?, language = ? WHERE id = ?",
        )
        .bind(&meta.title)
        .bind(&meta.description)
        .bind(&meta.icon)
        .bind(&meta.language)
        .bind(feed_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_fetch_outcome(
        &self,
        feed_id: i64,
        attempt: &FetchAttempt<'_>,
    ) -> Result<i64, DatabaseError> {
        let (streak,): (i64,) = if attempt.success {
            sqlx::query_as(
                "UPDATE feeds SET last_success_at = ?, last_attempt_at = ?,
                     consecutive_failures = 0, last_error = NULL
                 WHERE id = ? RETURNING consecutive_failures",
            )
            .bind(attempt.at)
            .bind(attempt.at)
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "UPDATE feeds SET last_attempt_at = ?,
                     consecutive_failures = consecutive_failures + 1, last_error = ?
                 WHERE id = ? RETURNING consecutive_failures",
            )
            .bind(attempt.at)
            .bind(attempt.error)
            .bind(feed_id)
            .fetch_one(&self.pool)
            .await?
        };
        Ok(streak)
    }

    async fn get_feed(&self, external_id: &str) -> Result<Option<FeedRecord>, DatabaseError> {
        let row: Option<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {} FROM feeds WHERE external_id = ?",
            FEED_COLUMNS
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FeedDbRow::into_record))
    }

    async fn list_feeds(&self) -> Result<Vec<FeedRecord>, DatabaseError> {
        let rows: Vec<FeedDbRow> = sqlx::query_as(&format!(
            "SELECT {} FROM feeds ORDER BY external_id",
            FEED_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedDbRow::into_record).collect())
    }
}
