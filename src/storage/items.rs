use async_trait::async_trait;

use super::repo::ItemStore;
use super::schema::Database;
use super::types::{encode_categories, DatabaseError, ItemDbRow, ItemRecord, ItemStats, NewItem};
use crate::feed::NormalizedItem;

const ITEM_COLUMNS: &str = "id, feed_id, identity_hash, native_id, title, link, description, \
     content, published, updated, author_name, author_email, categories, filtered, \
     filter_reason, first_seen_at, last_seen_at";

#[async_trait]
impl ItemStore for Database {
    async fn find_item(
        &self,
        feed_id: i64,
        identity_hash: &str,
    ) -> Result<Option<ItemRecord>, DatabaseError> {
        let row: Option<ItemDbRow> = sqlx::query_as(&format!(
            "SELECT {} FROM items WHERE feed_id = ? AND identity_hash = ?",
            ITEM_COLUMNS
        ))
        .bind(feed_id)
        .bind(identity_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ItemDbRow::into_record))
    }

    /// Two-phase upsert: INSERT OR IGNORE tells us whether the row is new,
    /// then existing rows get their mutable fields refreshed.
    async fn upsert_item(
        &self,
        feed_id: i64,
        new: &NewItem<'_>,
        seen_at: i64,
    ) -> Result<bool, DatabaseError> {
        let item = new.item;
        let categories = encode_categories(&item.categories);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO items (
                feed_id, identity_hash, native_id, title, link, description, content,
                published, updated, author_name, author_email, categories,
                filtered, filter_reason, first_seen_at, last_seen_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(feed_id)
        .bind(&item.identity_hash)
        .bind(&item.native_id)
        .bind(&item.title)
        .bind(&item.link)
        .bind(&item.description)
        .bind(&item.content)
        .bind(item.published)
        .bind(item.updated)
        .bind(&item.author_name)
        .bind(&item.author_email)
        .bind(&categories)
        .bind(new.filtered)
        .bind(new.filter_reason)
        .bind(seen_at)
        .bind(seen_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        if !inserted {
            sqlx::query(
                "UPDATE items SET last_seen_at = ?, description = ?, content = ?,
                     published = ?, updated = ?, author_name = ?, author_email = ?, categories = ?
                 WHERE feed_id = ? AND identity_hash = ?",
            )
            .bind(seen_at)
            .bind(&item.description)
            .bind(&item.content)
            .bind(item.published)
            .bind(item.updated)
            .bind(&item.author_name)
            .bind(&item.author_email)
            .bind(&categories)
            .bind(feed_id)
            .bind(&item.identity_hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(inserted)
    }

    async fn refresh_item(
        &self,
        item_id: i64,
        item: &NormalizedItem,
        seen_at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE items SET last_seen_at = ?, native_id = ?, description = ?, content = ?,
                 published = ?, updated = ?, author_name = ?, author_email = ?, categories = ?
             WHERE id = ?",
        )
        .bind(seen_at)
        .bind(&item.native_id)
        .bind(&item.description)
        .bind(&item.content)
        .bind(item.published)
        .bind(item.updated)
        .bind(&item.author_name)
        .bind(&item.author_email)
        .bind(encode_categories(&item.categories))
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_items(&self, feed_id: i64) -> Result<Vec<ItemRecord>, DatabaseError> {
        let rows: Vec<ItemDbRow> = sqlx::query_as(&format!(
            "SELECT {} FROM items WHERE feed_id = ?
             ORDER BY COALESCE(published, first_seen_at) DESC, id DESC",
            ITEM_COLUMNS
        ))
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ItemDbRow::into_record).collect())
    }

    async fn update_filter_outcome(
        &self,
        item_id: i64,
        filtered: bool,
        reason: Option<&str>,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE items SET filtered = ?, filter_reason = ? WHERE id = ?")
            .bind(filtered)
            .bind(reason)
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn item_stats(&self, feed_id: i64) -> Result<ItemStats, DatabaseError> {
        let (total, filtered, last_seen_at): (i64, i64, Option<i64>) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(filtered), 0), MAX(last_seen_at)
             FROM items WHERE feed_id = ?",
        )
        .bind(feed_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(ItemStats {
            total,
            admitted: total - filtered,
            filtered,
            last_seen_at,
        })
    }
}
