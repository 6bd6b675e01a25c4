use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Storage-level errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Database is locked by another process")]
    Locked,

    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A uniqueness constraint rejected the write
    #[error("Duplicate record: {0}")]
    Duplicate(String),

    /// Query engine rejected a filter, sort field or page request
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Failed to encode column: {0}")]
    Encode(#[from] serde_json::Error),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Classify a sqlx error, separating lock contention and unique violations.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.is_unique_violation() {
                return DatabaseError::Duplicate(db_err.message().to_string());
            }
        }

        let error_string = err.to_string().to_lowercase();
        // SQLITE_BUSY (5) / SQLITE_LOCKED (6)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
        {
            return DatabaseError::Locked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Embedded Value Types
// ============================================================================

/// A content block of an entry, reduced to value/type/language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    pub value: String,
    #[serde(rename = "type")]
    pub content_type: String,
    pub language: Option<String>,
}

/// An attached media file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enclosure {
    pub href: String,
    #[serde(rename = "type")]
    pub content_type: Option<String>,
    pub length: Option<u64>,
}

impl Enclosure {
    /// Returns `None` when `href` is blank.
    pub fn new(href: &str, content_type: Option<String>, length: Option<u64>) -> Option<Self> {
        let href = href.trim();
        if href.is_empty() {
            return None;
        }
        Some(Self {
            href: href.to_owned(),
            content_type: content_type.filter(|t| !t.trim().is_empty()),
            length,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Logo {
    pub url: String,
    /// True when derived from the site origin rather than provided by the feed
    pub is_default: bool,
}

// ============================================================================
// Subscriptions
// ============================================================================

/// One owner's subscription to one feed URL.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: i64,
    pub owner_id: String,
    pub url: String,
    pub title: Option<String>,
    pub display_title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub subtitle: Option<String>,
    pub version: Option<String>,
    pub logo: Option<Logo>,
    pub feed_updated: Option<i64>,
    /// Watermark: entries published at or before this time are considered processed
    pub newest_entry_pub_time: Option<i64>,
    pub updates_enabled: bool,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

/// Internal row type for subscription queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SubscriptionDbRow {
    pub id: i64,
    pub owner_id: String,
    pub url: String,
    pub title: Option<String>,
    pub display_title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub subtitle: Option<String>,
    pub version: Option<String>,
    pub logo_url: Option<String>,
    pub logo_is_default: bool,
    pub feed_updated: Option<i64>,
    pub newest_entry_pub_time: Option<i64>,
    pub updates_enabled: bool,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

impl SubscriptionDbRow {
    pub(crate) fn into_subscription(self) -> Subscription {
        Subscription {
            id: self.id,
            owner_id: self.owner_id,
            url: self.url,
            title: self.title,
            display_title: self.display_title,
            link: self.link,
            author: self.author,
            subtitle: self.subtitle,
            version: self.version,
            logo: self.logo_url.map(|url| Logo {
                url,
                is_default: self.logo_is_default,
            }),
            feed_updated: self.feed_updated,
            newest_entry_pub_time: self.newest_entry_pub_time,
            updates_enabled: self.updates_enabled,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Owner-editable subscription fields. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub display_title: Option<String>,
    pub updates_enabled: Option<bool>,
}

// ============================================================================
// Entries
// ============================================================================

/// One owner's copy of a feed item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub id: i64,
    pub subscription_id: Option<i64>,
    pub owner_id: String,
    pub feed_url: String,
    pub entry_key: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: i64,
    pub summary: Option<String>,
    pub content: Vec<ContentBlock>,
    pub enclosures: Vec<Enclosure>,
    pub is_read: bool,
    pub read_modified: Option<i64>,
    pub read_later: bool,
    pub read_later_modified: Option<i64>,
    pub is_hide: bool,
    pub hide_modified: Option<i64>,
    pub is_star: bool,
    pub star_modified: Option<i64>,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

/// Internal row type for entry queries; JSON columns are decoded in `into_entry`
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryDbRow {
    pub id: i64,
    pub subscription_id: Option<i64>,
    pub owner_id: String,
    pub feed_url: String,
    pub entry_key: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    pub published: i64,
    pub summary: Option<String>,
    pub content: String,
    pub enclosures: String,
    pub is_read: bool,
    pub read_modified: Option<i64>,
    pub read_later: bool,
    pub read_later_modified: Option<i64>,
    pub is_hide: bool,
    pub hide_modified: Option<i64>,
    pub is_star: bool,
    pub star_modified: Option<i64>,
    pub created_at: i64,
    pub updated_at: Option<i64>,
}

impl EntryDbRow {
    pub(crate) fn into_entry(self) -> Entry {
        let content = decode_json_column(self.id, "content", &self.content);
        let enclosures = decode_json_column(self.id, "enclosures", &self.enclosures);
        Entry {
            id: self.id,
            subscription_id: self.subscription_id,
            owner_id: self.owner_id,
            feed_url: self.feed_url,
            entry_key: self.entry_key,
            title: self.title,
            link: self.link,
            author: self.author,
            published: self.published,
            summary: self.summary,
            content,
            enclosures,
            is_read: self.is_read,
            read_modified: self.read_modified,
            read_later: self.read_later,
            read_later_modified: self.read_later_modified,
            is_hide: self.is_hide,
            hide_modified: self.hide_modified,
            is_star: self.is_star,
            star_modified: self.star_modified,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn decode_json_column<T: serde::de::DeserializeOwned>(
    entry_id: i64,
    column: &str,
    raw: &str,
) -> Vec<T> {
    match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(
                entry_id = entry_id,
                column = column,
                error = %e,
                "Undecodable JSON column, treating as empty"
            );
            Vec::new()
        }
    }
}

/// An entry authored directly by its owner.
#[derive(Debug, Clone, Default)]
pub struct NewEntry {
    pub feed_url: String,
    pub title: Option<String>,
    pub link: Option<String>,
    pub author: Option<String>,
    /// Defaults to creation time
    pub published: Option<i64>,
    pub summary: Option<String>,
    pub content: Vec<ContentBlock>,
    pub enclosures: Vec<Enclosure>,
}

/// Owner-controlled state flags. `None` leaves a flag unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryStateUpdate {
    pub is_read: Option<bool>,
    pub read_later: Option<bool>,
    pub is_hide: Option<bool>,
    pub is_star: Option<bool>,
}

// ============================================================================
// Tags
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Tag {
    pub id: i64,
    pub owner_id: String,
    pub name: String,
    pub path: Option<String>,
    pub icon_type: Option<String>,
    pub icon_value: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewTag {
    pub name: String,
    pub path: Option<String>,
    pub icon_type: Option<String>,
    pub icon_value: Option<String>,
}

// ============================================================================
// Feed Groups
// ============================================================================

/// A named folder of an owner's subscriptions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct FeedGroup {
    pub id: i64,
    pub owner_id: String,
    pub name: String,
    pub icon_type: Option<String>,
    pub icon_value: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct NewFeedGroup {
    pub name: String,
    pub icon_type: Option<String>,
    pub icon_value: Option<String>,
}
