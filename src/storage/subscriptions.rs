use sqlx::QueryBuilder;

use super::entries::insert_entries;
use super::schema::Database;
use super::types::{DatabaseError, Subscription, SubscriptionDbRow, SubscriptionUpdate};
use crate::feed::{FeedDescriptor, NormalizedEntry};

pub(crate) const SUBSCRIPTION_COLUMNS: &str = "id, owner_id, url, title, display_title, link, \
     author, subtitle, version, logo_url, logo_is_default, feed_updated, newest_entry_pub_time, \
     updates_enabled, last_error, created_at, updated_at";

/// Result of one subscription's fan-out step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    /// Entries newly written for the owner
    pub inserted: usize,
    /// Watermark after the step
    pub watermark: Option<i64>,
}

/// Entries strictly newer than `watermark`. A missing watermark selects everything.
pub(crate) fn entries_after(
    entries: &[NormalizedEntry],
    watermark: Option<i64>,
) -> Vec<&NormalizedEntry> {
    entries
        .iter()
        .filter(|e| watermark.map_or(true, |w| e.published > w))
        .collect()
}

impl Database {
    // ========================================================================
    // Subscription Operations
    // ========================================================================

    /// Persist a new subscription from a freshly parsed descriptor.
    ///
    /// `display_title` falls back to the feed's own title. The watermark
    /// starts empty so the first sync delivers every entry in the document.
    ///
    /// # Errors
    ///
    /// `DatabaseError::Duplicate` if the owner already follows `descriptor.url`.
    pub async fn insert_subscription(
        &self,
        owner_id: &str,
        descriptor: &FeedDescriptor,
        display_title: Option<&str>,
    ) -> Result<Subscription, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let display_title = display_title
            .map(str::to_owned)
            .or_else(|| descriptor.title.clone());

        let sql = format!(
            "INSERT INTO subscriptions (owner_id, url, title, display_title, link, author, \
             subtitle, version, logo_url, logo_is_default, feed_updated, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        let row = sqlx::query_as::<_, SubscriptionDbRow>(&sql)
            .bind(owner_id)
            .bind(&descriptor.url)
            .bind(&descriptor.title)
            .bind(&display_title)
            .bind(&descriptor.link)
            .bind(&descriptor.author)
            .bind(&descriptor.subtitle)
            .bind(&descriptor.version)
            .bind(&descriptor.logo.url)
            .bind(descriptor.logo.is_default)
            .bind(descriptor.updated)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        Ok(row.into_subscription())
    }

    /// Look up an owner's subscription by feed URL.
    pub async fn find_subscription_by_url(
        &self,
        owner_id: &str,
        url: &str,
    ) -> Result<Option<Subscription>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE owner_id = ? AND url = ?",
            SUBSCRIPTION_COLUMNS
        );
        let row = sqlx::query_as::<_, SubscriptionDbRow>(&sql)
            .bind(owner_id)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(SubscriptionDbRow::into_subscription))
    }

    pub async fn get_subscription(
        &self,
        owner_id: &str,
        id: i64,
    ) -> Result<Option<Subscription>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE owner_id = ? AND id = ?",
            SUBSCRIPTION_COLUMNS
        );
        let row = sqlx::query_as::<_, SubscriptionDbRow>(&sql)
            .bind(owner_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(SubscriptionDbRow::into_subscription))
    }

    /// All subscriptions of one owner, oldest first.
    pub async fn get_owner_subscriptions(
        &self,
        owner_id: &str,
        enabled_only: bool,
    ) -> Result<Vec<Subscription>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE owner_id = ? AND (updates_enabled = 1 OR ? = 0) \
             ORDER BY id",
            SUBSCRIPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SubscriptionDbRow>(&sql)
            .bind(owner_id)
            .bind(enabled_only)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(SubscriptionDbRow::into_subscription)
            .collect())
    }

    /// Distinct feed URLs with at least one enabled subscription.
    pub async fn distinct_enabled_urls(&self) -> Result<Vec<String>, DatabaseError> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT url FROM subscriptions WHERE updates_enabled = 1 ORDER BY url",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Enabled subscriptions (across all owners) following `url`.
    pub async fn get_enabled_subscriptions_for_url(
        &self,
        url: &str,
    ) -> Result<Vec<Subscription>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE url = ? AND updates_enabled = 1 ORDER BY id",
            SUBSCRIPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SubscriptionDbRow>(&sql)
            .bind(url)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(SubscriptionDbRow::into_subscription)
            .collect())
    }

    /// Apply owner edits. Returns `None` if the owner has no such subscription.
    pub async fn update_subscription(
        &self,
        owner_id: &str,
        id: i64,
        update: &SubscriptionUpdate,
    ) -> Result<Option<Subscription>, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            "UPDATE subscriptions SET display_title = COALESCE(?, display_title), \
             updates_enabled = COALESCE(?, updates_enabled), updated_at = ? \
             WHERE owner_id = ? AND id = ? RETURNING {}",
            SUBSCRIPTION_COLUMNS
        );
        let row = sqlx::query_as::<_, SubscriptionDbRow>(&sql)
            .bind(&update.display_title)
            .bind(update.updates_enabled)
            .bind(now)
            .bind(owner_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(SubscriptionDbRow::into_subscription))
    }

    /// Delete a subscription. Its entries stay and lose their subscription reference.
    pub async fn delete_subscription(
        &self,
        owner_id: &str,
        id: i64,
    ) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE owner_id = ? AND id = ?")
            .bind(owner_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Explicitly move the watermark, possibly backwards (`None` clears it).
    ///
    /// This is the only operation allowed to lower a watermark.
    pub async fn reset_watermark(
        &self,
        owner_id: &str,
        id: i64,
        to: Option<i64>,
    ) -> Result<bool, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE subscriptions SET newest_entry_pub_time = ?, updated_at = ? \
             WHERE owner_id = ? AND id = ?",
        )
        .bind(to)
        .bind(now)
        .bind(owner_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a fetch failure on every subscription to `url`, enabled or not.
    ///
    /// Returns the number of subscriptions marked.
    pub async fn set_url_error(&self, url: &str, error: &str) -> Result<u64, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let result =
            sqlx::query("UPDATE subscriptions SET last_error = ?, updated_at = ? WHERE url = ?")
                .bind(error)
                .bind(now)
                .bind(url)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Record the same sync error on several subscriptions in one statement.
    pub async fn batch_set_subscription_errors(
        &self,
        ids: &[i64],
        error: &str,
    ) -> Result<(), DatabaseError> {
        if ids.is_empty() {
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp();
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("UPDATE subscriptions SET last_error = ");
        builder.push_bind(error);
        builder.push(", updated_at = ");
        builder.push_bind(now);
        builder.push(" WHERE id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Fan freshly parsed entries out to one subscription, atomically.
    ///
    /// Within a single transaction:
    /// 1. claims the subscription row and reads its current watermark
    /// 2. inserts entries published strictly after that watermark
    ///    (insert-if-absent on `(owner, feed_url, entry_key)`)
    /// 3. advances the watermark to `MAX(current, newest_observed)`
    /// 4. refreshes the metadata snapshot and clears `last_error`
    ///
    /// `newest_observed` is the maximum `published` across *all* entries of
    /// the fetch, not only the inserted ones; `None` leaves the watermark as is.
    ///
    /// Returns `None` if the subscription was deleted or disabled since it
    /// was selected.
    pub async fn complete_subscription_sync(
        &self,
        subscription_id: i64,
        descriptor: &FeedDescriptor,
        entries: &[NormalizedEntry],
        newest_observed: Option<i64>,
    ) -> Result<Option<FanOut>, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        // Write first so the transaction holds the write lock before reading
        let claimed: Option<(String, Option<i64>)> = sqlx::query_as(
            "UPDATE subscriptions SET updated_at = ? WHERE id = ? AND updates_enabled = 1 \
             RETURNING owner_id, newest_entry_pub_time",
        )
        .bind(now)
        .bind(subscription_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((owner_id, watermark)) = claimed else {
            tx.rollback().await?;
            return Ok(None);
        };

        let selected = entries_after(entries, watermark);
        let inserted =
            insert_entries(&mut *tx, Some(subscription_id), &owner_id, &selected, now).await?;

        let (watermark,): (Option<i64>,) = sqlx::query_as(
            r#"
            UPDATE subscriptions SET
                newest_entry_pub_time = COALESCE(MAX(newest_entry_pub_time, ?1), newest_entry_pub_time, ?1),
                title = ?2,
                link = ?3,
                author = ?4,
                subtitle = ?5,
                version = ?6,
                logo_url = ?7,
                logo_is_default = ?8,
                feed_updated = COALESCE(?9, feed_updated),
                last_error = NULL
            WHERE id = ?10
            RETURNING newest_entry_pub_time
        "#,
        )
        .bind(newest_observed)
        .bind(&descriptor.title)
        .bind(&descriptor.link)
        .bind(&descriptor.author)
        .bind(&descriptor.subtitle)
        .bind(&descriptor.version)
        .bind(&descriptor.logo.url)
        .bind(descriptor.logo.is_default)
        .bind(descriptor.updated)
        .bind(subscription_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::debug!(
            subscription_id = subscription_id,
            owner = %owner_id,
            selected = selected.len(),
            inserted = inserted,
            watermark = ?watermark,
            "Subscription fan-out committed"
        );

        Ok(Some(FanOut {
            inserted,
            watermark,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Logo;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn descriptor(url: &str) -> FeedDescriptor {
        FeedDescriptor {
            url: url.to_string(),
            title: Some("Example".to_string()),
            link: "https://example.com".to_string(),
            author: None,
            subtitle: Some("Sub".to_string()),
            version: "rss20".to_string(),
            logo: Logo {
                url: "https://example.com/favicon.ico".to_string(),
                is_default: true,
            },
            updated: None,
        }
    }

    fn entry(key: &str, published: i64) -> NormalizedEntry {
        NormalizedEntry {
            entry_key: key.to_string(),
            feed_url: "https://example.com/rss".to_string(),
            title: Some(format!("Entry {}", key)),
            link: Some(format!("https://example.com/{}", key)),
            author: None,
            published,
            summary: None,
            content: Vec::new(),
            enclosures: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_url_error_reaches_disabled_subscriptions() {
        let db = test_db().await;
        let url = "https://example.com/rss";
        let d = descriptor(url);
        let enabled = db.insert_subscription("alice", &d, None).await.unwrap();
        let disabled = db.insert_subscription("bob", &d, None).await.unwrap();
        let other = db
            .insert_subscription("bob", &descriptor("https://other.example.com/rss"), None)
            .await
            .unwrap();
        let update = SubscriptionUpdate {
            updates_enabled: Some(false),
            ..Default::default()
        };
        db.update_subscription("bob", disabled.id, &update).await.unwrap();

        assert_eq!(db.set_url_error(url, "HTTP error: status 500").await.unwrap(), 2);

        for (owner, id) in [("alice", enabled.id), ("bob", disabled.id)] {
            let sub = db.get_subscription(owner, id).await.unwrap().unwrap();
            assert_eq!(sub.last_error.as_deref(), Some("HTTP error: status 500"));
        }
        let other = db.get_subscription("bob", other.id).await.unwrap().unwrap();
        assert_eq!(other.last_error, None);
    }

    #[test]
    fn test_entries_after_is_strict() {
        let t = 1_700_000_000;
        let entries = vec![entry("a", t - 1), entry("b", t), entry("c", t + 5)];
        let selected = entries_after(&entries, Some(t));
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].entry_key, "c");
    }

    #[test]
    fn test_entries_after_without_watermark_selects_all() {
        let entries = vec![entry("a", 1), entry("b", 2)];
        assert_eq!(entries_after(&entries, None).len(), 2);
    }

    #[tokio::test]
    async fn test_insert_subscription_defaults_display_title() {
        let db = test_db().await;
        let sub = db
            .insert_subscription("alice", &descriptor("https://example.com/rss"), None)
            .await
            .unwrap();
        assert_eq!(sub.display_title.as_deref(), Some("Example"));
        assert_eq!(sub.newest_entry_pub_time, None);
        assert!(sub.updates_enabled);
        assert_eq!(
            sub.logo,
            Some(Logo {
                url: "https://example.com/favicon.ico".into(),
                is_default: true
            })
        );
    }

    #[tokio::test]
    async fn test_insert_duplicate_is_rejected() {
        let db = test_db().await;
        let d = descriptor("https://example.com/rss");
        db.insert_subscription("alice", &d, None).await.unwrap();
        let err = db.insert_subscription("alice", &d, Some("Again")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Duplicate(_)));

        // Another owner may follow the same URL
        db.insert_subscription("bob", &d, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_enabled_urls() {
        let db = test_db().await;
        db.insert_subscription("alice", &descriptor("https://a.example.com/rss"), None)
            .await
            .unwrap();
        db.insert_subscription("bob", &descriptor("https://a.example.com/rss"), None)
            .await
            .unwrap();
        let off = db
            .insert_subscription("bob", &descriptor("https://b.example.com/rss"), None)
            .await
            .unwrap();
        db.update_subscription(
            "bob",
            off.id,
            &SubscriptionUpdate {
                updates_enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let urls = db.distinct_enabled_urls().await.unwrap();
        assert_eq!(urls, vec!["https://a.example.com/rss".to_string()]);
        assert_eq!(
            db.get_enabled_subscriptions_for_url("https://a.example.com/rss")
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_update_is_owner_scoped() {
        let db = test_db().await;
        let sub = db
            .insert_subscription("alice", &descriptor("https://example.com/rss"), None)
            .await
            .unwrap();

        let update = SubscriptionUpdate {
            display_title: Some("Renamed".into()),
            updates_enabled: None,
        };
        let foreign = db.update_subscription("mallory", sub.id, &update).await;
        assert!(foreign.unwrap().is_none());

        let updated = db
            .update_subscription("alice", sub.id, &update)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.display_title.as_deref(), Some("Renamed"));
        assert!(updated.updates_enabled);
        assert!(updated.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_complete_sync_inserts_and_advances() {
        let db = test_db().await;
        let sub = db
            .insert_subscription("alice", &descriptor("https://example.com/rss"), None)
            .await
            .unwrap();
        db.batch_set_subscription_errors(&[sub.id], "boom").await.unwrap();

        let entries = vec![entry("a", 100), entry("b", 200)];
        let fan_out = db
            .complete_subscription_sync(
                sub.id,
                &descriptor("https://example.com/rss"),
                &entries,
                Some(200),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            fan_out,
            FanOut {
                inserted: 2,
                watermark: Some(200)
            }
        );

        let sub = db.get_subscription("alice", sub.id).await.unwrap().unwrap();
        assert_eq!(sub.newest_entry_pub_time, Some(200));
        assert_eq!(sub.last_error, None);
    }

    #[tokio::test]
    async fn test_complete_sync_never_lowers_watermark() {
        let db = test_db().await;
        let d = descriptor("https://example.com/rss");
        let sub = db.insert_subscription("alice", &d, None).await.unwrap();
        db.reset_watermark("alice", sub.id, Some(500)).await.unwrap();

        let fan_out = db
            .complete_subscription_sync(sub.id, &d, &[entry("old", 300)], Some(300))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            fan_out,
            FanOut {
                inserted: 0,
                watermark: Some(500)
            }
        );
    }

    #[tokio::test]
    async fn test_complete_sync_without_entries_keeps_watermark() {
        let db = test_db().await;
        let d = descriptor("https://example.com/rss");
        let sub = db.insert_subscription("alice", &d, None).await.unwrap();
        db.reset_watermark("alice", sub.id, Some(42)).await.unwrap();

        let fan_out = db
            .complete_subscription_sync(sub.id, &d, &[], None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fan_out.watermark, Some(42));
    }

    #[tokio::test]
    async fn test_complete_sync_skips_disabled() {
        let db = test_db().await;
        let d = descriptor("https://example.com/rss");
        let sub = db.insert_subscription("alice", &d, None).await.unwrap();
        db.update_subscription(
            "alice",
            sub.id,
            &SubscriptionUpdate {
                updates_enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let result = db
            .complete_subscription_sync(sub.id, &d, &[entry("a", 1)], Some(1))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_reset_watermark_then_resync_collapses_duplicates() {
        let db = test_db().await;
        let d = descriptor("https://example.com/rss");
        let sub = db.insert_subscription("alice", &d, None).await.unwrap();
        let entries = vec![entry("a", 100), entry("b", 200)];

        db.complete_subscription_sync(sub.id, &d, &entries, Some(200))
            .await
            .unwrap();
        assert!(db.reset_watermark("alice", sub.id, None).await.unwrap());
        let again = db
            .complete_subscription_sync(sub.id, &d, &entries, Some(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.inserted, 0);
    }

    #[tokio::test]
    async fn test_delete_subscription_keeps_entries() {
        let db = test_db().await;
        let d = descriptor("https://example.com/rss");
        let sub = db.insert_subscription("alice", &d, None).await.unwrap();
        db.complete_subscription_sync(sub.id, &d, &[entry("a", 1)], Some(1))
            .await
            .unwrap();

        assert!(!db.delete_subscription("bob", sub.id).await.unwrap());
        assert!(db.delete_subscription("alice", sub.id).await.unwrap());

        let remaining: (i64, Option<i64>) =
            sqlx::query_as("SELECT COUNT(*), MAX(subscription_id) FROM entries")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(remaining, (1, None));
    }
}
