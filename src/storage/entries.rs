use sqlx::{QueryBuilder, SqliteConnection};

use super::schema::Database;
use super::types::{DatabaseError, Entry, EntryDbRow, EntryStateUpdate, NewEntry};
use crate::feed::{generate_entry_key, NormalizedEntry};

pub(crate) const ENTRY_COLUMNS: &str = "id, subscription_id, owner_id, feed_url, entry_key, \
     title, link, author, published, summary, content, enclosures, is_read, read_modified, \
     read_later, read_later_modified, is_hide, hide_modified, is_star, star_modified, \
     created_at, updated_at";

/// 12 bound columns per row keeps a chunk well under SQLite's parameter limit.
const BATCH_SIZE: usize = 50;

/// Insert-if-absent on `(owner_id, feed_url, entry_key)`.
///
/// Runs on the caller's connection so it can join an open transaction.
/// Returns the number of rows actually written; rows that already existed
/// for the owner are left untouched.
pub(crate) async fn insert_entries(
    conn: &mut SqliteConnection,
    subscription_id: Option<i64>,
    owner_id: &str,
    entries: &[&NormalizedEntry],
    now: i64,
) -> Result<usize, DatabaseError> {
    let mut inserted = 0usize;

    for chunk in entries.chunks(BATCH_SIZE) {
        let encoded = chunk
            .iter()
            .map(|e| {
                Ok((
                    serde_json::to_string(&e.content)?,
                    serde_json::to_string(&e.enclosures)?,
                ))
            })
            .collect::<Result<Vec<(String, String)>, serde_json::Error>>()?;

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO entries (subscription_id, owner_id, feed_url, entry_key, \
             title, link, author, published, summary, content, enclosures, created_at) ",
        );
        let rows = chunk.iter().zip(encoded.iter());
        builder.push_values(rows, |mut b, (entry, (content, enclosures))| {
            b.push_bind(subscription_id)
                .push_bind(owner_id)
                .push_bind(&entry.feed_url)
                .push_bind(&entry.entry_key)
                .push_bind(&entry.title)
                .push_bind(&entry.link)
                .push_bind(&entry.author)
                .push_bind(entry.published)
                .push_bind(&entry.summary)
                .push_bind(content)
                .push_bind(enclosures)
                .push_bind(now);
        });

        let result = builder.build().execute(&mut *conn).await?;
        inserted += result.rows_affected() as usize;
    }

    Ok(inserted)
}

impl Database {
    // ========================================================================
    // Entry Operations
    // ========================================================================

    /// Create an entry authored by its owner.
    ///
    /// The natural key is derived from link, title, summary and the given
    /// publish time, so creating the same entry twice returns the row that
    /// already exists.
    pub async fn create_entry(
        &self,
        owner_id: &str,
        new: &NewEntry,
    ) -> Result<Entry, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let published = new.published.unwrap_or(now);
        let entry = NormalizedEntry {
            entry_key: generate_entry_key(
                None,
                new.link.as_deref(),
                new.title.as_deref().unwrap_or(""),
                new.summary.as_deref(),
                new.published,
            ),
            feed_url: new.feed_url.clone(),
            title: new.title.clone(),
            link: new.link.clone(),
            author: new.author.clone(),
            published,
            summary: new.summary.clone(),
            content: new.content.clone(),
            enclosures: new.enclosures.clone(),
        };

        let mut conn = self.pool.acquire().await?;
        insert_entries(&mut conn, None, owner_id, &[&entry], now).await?;

        let sql = format!(
            "SELECT {} FROM entries WHERE owner_id = ? AND feed_url = ? AND entry_key = ?",
            ENTRY_COLUMNS
        );
        let row = sqlx::query_as::<_, EntryDbRow>(&sql)
            .bind(owner_id)
            .bind(&entry.feed_url)
            .bind(&entry.entry_key)
            .fetch_one(&mut *conn)
            .await?;
        Ok(row.into_entry())
    }

    pub async fn get_entry(&self, owner_id: &str, id: i64) -> Result<Option<Entry>, DatabaseError> {
        let sql = format!("SELECT {} FROM entries WHERE owner_id = ? AND id = ?", ENTRY_COLUMNS);
        let row = sqlx::query_as::<_, EntryDbRow>(&sql)
            .bind(owner_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(EntryDbRow::into_entry))
    }

    /// Apply state flag changes to one entry.
    ///
    /// Each `*_modified` timestamp moves only when its flag actually changes
    /// value; setting a flag to what it already is leaves it alone.
    /// Returns `None` if the owner has no such entry.
    pub async fn update_entry_state(
        &self,
        owner_id: &str,
        id: i64,
        update: EntryStateUpdate,
    ) -> Result<Option<Entry>, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        // SET expressions all see the pre-update row
        let sql = format!(
            r#"
            UPDATE entries SET
                read_modified = CASE WHEN ?1 IS NOT NULL AND ?1 != is_read THEN ?5 ELSE read_modified END,
                read_later_modified = CASE WHEN ?2 IS NOT NULL AND ?2 != read_later THEN ?5 ELSE read_later_modified END,
                hide_modified = CASE WHEN ?3 IS NOT NULL AND ?3 != is_hide THEN ?5 ELSE hide_modified END,
                star_modified = CASE WHEN ?4 IS NOT NULL AND ?4 != is_star THEN ?5 ELSE star_modified END,
                is_read = COALESCE(?1, is_read),
                read_later = COALESCE(?2, read_later),
                is_hide = COALESCE(?3, is_hide),
                is_star = COALESCE(?4, is_star),
                updated_at = ?5
            WHERE owner_id = ?6 AND id = ?7
            RETURNING {}
        "#,
            ENTRY_COLUMNS
        );
        let row = sqlx::query_as::<_, EntryDbRow>(&sql)
            .bind(update.is_read)
            .bind(update.read_later)
            .bind(update.is_hide)
            .bind(update.is_star)
            .bind(now)
            .bind(owner_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(EntryDbRow::into_entry))
    }

    /// Delete one entry; its tag associations go with it.
    pub async fn delete_entry(&self, owner_id: &str, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM entries WHERE owner_id = ? AND id = ?")
            .bind(owner_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Number of entries an owner holds for a feed URL.
    pub async fn count_entries_for_feed(
        &self,
        owner_id: &str,
        feed_url: &str,
    ) -> Result<i64, DatabaseError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM entries WHERE owner_id = ? AND feed_url = ?")
                .bind(owner_id)
                .bind(feed_url)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ContentBlock, Enclosure};
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn new_entry(title: &str) -> NewEntry {
        NewEntry {
            feed_url: "https://example.com/rss".into(),
            title: Some(title.into()),
            link: Some(format!("https://example.com/{}", title)),
            published: Some(1_700_000_000),
            content: vec![ContentBlock {
                value: "<p>hi</p>".into(),
                content_type: "text/html".into(),
                language: Some("en".into()),
            }],
            enclosures: Enclosure::new(
                "https://example.com/a.mp3",
                Some("audio/mpeg".into()),
                Some(10),
            )
            .into_iter()
            .collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_entry_round_trips_json_columns() {
        let db = test_db().await;
        let created = db.create_entry("alice", &new_entry("one")).await.unwrap();
        assert_eq!(created.subscription_id, None);
        assert_eq!(created.content.len(), 1);
        assert_eq!(created.enclosures[0].length, Some(10));
        assert!(!created.is_read);

        let fetched = db.get_entry("alice", created.id).await.unwrap().unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_create_entry_twice_returns_existing() {
        let db = test_db().await;
        let first = db.create_entry("alice", &new_entry("one")).await.unwrap();
        let second = db.create_entry("alice", &new_entry("one")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(db.count_entries_for_feed("alice", "https://example.com/rss").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_entries_are_owner_scoped() {
        let db = test_db().await;
        let entry = db.create_entry("alice", &new_entry("one")).await.unwrap();
        assert!(db.get_entry("bob", entry.id).await.unwrap().is_none());
        assert!(!db.delete_entry("bob", entry.id).await.unwrap());
        assert!(db.delete_entry("alice", entry.id).await.unwrap());
        assert!(db.get_entry("alice", entry.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_update_bumps_only_changed_flags() {
        let db = test_db().await;
        let entry = db.create_entry("alice", &new_entry("one")).await.unwrap();

        let updated = db
            .update_entry_state(
                "alice",
                entry.id,
                EntryStateUpdate {
                    is_read: Some(true),
                    is_star: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert!(updated.is_read);
        assert!(updated.read_modified.is_some());
        // Already false, so not a change
        assert_eq!(updated.star_modified, None);
        assert_eq!(updated.read_later_modified, None);
        assert!(updated.updated_at.is_some());
    }

    #[tokio::test]
    async fn test_state_update_unknown_entry() {
        let db = test_db().await;
        let result = db
            .update_entry_state("alice", 999, EntryStateUpdate::default())
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_insert_entries_ignores_existing_keys() {
        let db = test_db().await;
        let entry = NormalizedEntry {
            entry_key: "guid-1".into(),
            feed_url: "https://example.com/rss".into(),
            title: Some("t".into()),
            link: None,
            author: None,
            published: 1,
            summary: None,
            content: Vec::new(),
            enclosures: Vec::new(),
        };

        let mut conn = db.pool.acquire().await.unwrap();
        let first = insert_entries(&mut conn, None, "alice", &[&entry, &entry], 1).await.unwrap();
        let second = insert_entries(&mut conn, None, "alice", &[&entry], 2).await.unwrap();
        let other_owner = insert_entries(&mut conn, None, "bob", &[&entry], 2).await.unwrap();
        assert_eq!((first, second, other_owner), (1, 0, 1));
    }
}
