use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    pub(crate) max_page_size: u32,
}

impl Database {
    pub const DEFAULT_MAX_PAGE_SIZE: u32 = 100;

    /// Open a database connection and run migrations.
    ///
    /// `:memory:` opens a private in-memory database; it is served by a
    /// single connection so every query sees the same data.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Locked` if another process holds the file lock,
    /// `DatabaseError::Migration` if the schema could not be applied.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let in_memory = path == ":memory:";
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: waits up to 5 seconds for locks held by a concurrent
        // sync pass before returning SQLITE_BUSY.
        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .acquire_timeout(Duration::from_secs(10));
        if in_memory {
            // The data lives only as long as its connection
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let db = Self {
            pool,
            max_page_size: Self::DEFAULT_MAX_PAGE_SIZE,
        };
        db.migrate().await.map_err(|e| match DatabaseError::from_sqlx(e) {
            DatabaseError::Locked => DatabaseError::Locked,
            other => DatabaseError::Migration(other.to_string()),
        })?;
        tracing::debug!(path = %path, "Database opened");
        Ok(db)
    }

    /// Cap the page size served by [`Database::find`].
    pub fn with_max_page_size(mut self, max_page_size: u32) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }

    /// Run database migrations atomically within a transaction.
    ///
    /// All statements use `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                id INTEGER PRIMARY KEY,
                owner_id TEXT NOT NULL,
                url TEXT NOT NULL,
                title TEXT,
                display_title TEXT,
                link TEXT,
                author TEXT,
                subtitle TEXT,
                version TEXT,
                logo_url TEXT,
                logo_is_default INTEGER NOT NULL DEFAULT 1,
                feed_updated INTEGER,
                newest_entry_pub_time INTEGER,
                updates_enabled INTEGER NOT NULL DEFAULT 1,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER,
                UNIQUE(owner_id, url)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Batch pass: SELECT DISTINCT url ... WHERE updates_enabled = 1, then per-URL lookups
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_subscriptions_url_enabled ON subscriptions(url, updates_enabled)",
        )
        .execute(&mut *tx)
        .await?;

        // Entries outlive their subscription: the reference is nulled on delete
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                subscription_id INTEGER REFERENCES subscriptions(id) ON DELETE SET NULL,
                owner_id TEXT NOT NULL,
                feed_url TEXT NOT NULL,
                entry_key TEXT NOT NULL,
                title TEXT,
                link TEXT,
                author TEXT,
                published INTEGER NOT NULL,
                summary TEXT,
                content TEXT NOT NULL DEFAULT '[]',
                enclosures TEXT NOT NULL DEFAULT '[]',
                is_read INTEGER NOT NULL DEFAULT 0,
                read_modified INTEGER,
                read_later INTEGER NOT NULL DEFAULT 0,
                read_later_modified INTEGER,
                is_hide INTEGER NOT NULL DEFAULT 0,
                hide_modified INTEGER,
                is_star INTEGER NOT NULL DEFAULT 0,
                star_modified INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER,
                UNIQUE(owner_id, feed_url, entry_key)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_owner_published ON entries(owner_id, published DESC)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_owner_created ON entries(owner_id, created_at DESC)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_subscription ON entries(subscription_id)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tags (
                id INTEGER PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                path TEXT,
                icon_type TEXT,
                icon_value TEXT,
                updated_at INTEGER NOT NULL,
                UNIQUE(owner_id, name)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Deleting a tag or an entry drops the association rows
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entry_tags (
                entry_id INTEGER NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
                tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
                PRIMARY KEY (entry_id, tag_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_entry_tags_tag ON entry_tags(tag_id)")
            .execute(&mut *tx)
            .await?;

        // Group names are labels only; an owner may reuse one
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_groups (
                id INTEGER PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                icon_type TEXT,
                icon_value TEXT,
                updated_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_feed_groups_owner ON feed_groups(owner_id, name)",
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS group_subscriptions (
                group_id INTEGER NOT NULL REFERENCES feed_groups(id) ON DELETE CASCADE,
                subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
                PRIMARY KEY (group_id, subscription_id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_group_subscriptions_sub \
             ON group_subscriptions(subscription_id)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
