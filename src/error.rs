//! Error taxonomy shared by the sync engine and its callers.
//!
//! [`SyncError`] is what every public operation returns. Handlers in the
//! surrounding API layer map it to a response through [`ErrorKind`], whose
//! code/message/status metadata is fixed at compile time.
use thiserror::Error;

use crate::feed::FetchError;
use crate::storage::DatabaseError;
use crate::util::UrlValidationError;

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

// ============================================================================
// Error Kinds
// ============================================================================

/// Classification of a [`SyncError`] with its response metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    MalformedFeed,
    FeedUnreachable,
    DuplicateSubscription,
    SubscriptionNotFound,
    EntryNotFound,
    TagNotFound,
    GroupNotFound,
    Validation,
    Server,
}

impl ErrorKind {
    /// Stable business code used by the REST envelope.
    pub const fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "4022",
            ErrorKind::SubscriptionNotFound
            | ErrorKind::EntryNotFound
            | ErrorKind::TagNotFound
            | ErrorKind::GroupNotFound => "4004",
            ErrorKind::DuplicateSubscription => "4009",
            ErrorKind::MalformedFeed | ErrorKind::FeedUnreachable => "5002",
            ErrorKind::Timeout => "5004",
            ErrorKind::Server => "5000",
        }
    }

    /// Default human readable message for the kind.
    pub const fn message(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "Feed fetch timed out",
            ErrorKind::MalformedFeed => "Feed could not be parsed",
            ErrorKind::FeedUnreachable => "Feed could not be retrieved",
            ErrorKind::DuplicateSubscription => "Already subscribed to this feed",
            ErrorKind::SubscriptionNotFound => "Subscription not found",
            ErrorKind::EntryNotFound => "Entry not found",
            ErrorKind::TagNotFound => "Tag not found",
            ErrorKind::GroupNotFound => "Feed group not found",
            ErrorKind::Validation => "Validation error",
            ErrorKind::Server => "Internal server error",
        }
    }

    /// HTTP status the API layer should answer with.
    pub const fn status(self) -> u16 {
        match self {
            ErrorKind::Validation => 422,
            ErrorKind::SubscriptionNotFound
            | ErrorKind::EntryNotFound
            | ErrorKind::TagNotFound
            | ErrorKind::GroupNotFound => 404,
            ErrorKind::DuplicateSubscription => 409,
            ErrorKind::MalformedFeed | ErrorKind::FeedUnreachable => 502,
            ErrorKind::Timeout => 504,
            ErrorKind::Server => 500,
        }
    }

    /// Whether the next scheduled pass may succeed without intervention.
    pub const fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::FeedUnreachable | ErrorKind::Server)
    }
}

// ============================================================================
// Sync Error
// ============================================================================

#[derive(Debug, Error)]
pub enum SyncError {
    /// Fetch + parse exceeded the configured bound.
    #[error("Timed out after {0}s while fetching feed")]
    Timeout(u64),

    /// Fatal parse failure or unrecognized feed format.
    #[error("Malformed feed: {0}")]
    MalformedFeed(String),

    /// Network failure, non-2xx response, or oversized body.
    #[error("Feed unreachable: {0}")]
    FeedUnreachable(String),

    #[error("Already subscribed to {url}")]
    DuplicateSubscription { url: String },

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(i64),

    #[error("Entry {0} not found")]
    EntryNotFound(i64),

    #[error("Tag {0} not found")]
    TagNotFound(i64),

    #[error("Feed group {0} not found")]
    GroupNotFound(i64),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Server error: {0}")]
    Server(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Timeout(_) => ErrorKind::Timeout,
            SyncError::MalformedFeed(_) => ErrorKind::MalformedFeed,
            SyncError::FeedUnreachable(_) => ErrorKind::FeedUnreachable,
            SyncError::DuplicateSubscription { .. } => ErrorKind::DuplicateSubscription,
            SyncError::SubscriptionNotFound(_) => ErrorKind::SubscriptionNotFound,
            SyncError::EntryNotFound(_) => ErrorKind::EntryNotFound,
            SyncError::TagNotFound(_) => ErrorKind::TagNotFound,
            SyncError::GroupNotFound(_) => ErrorKind::GroupNotFound,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Server(_) => ErrorKind::Server,
        }
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        SyncError::Validation(msg.into())
    }
}

impl From<FetchError> for SyncError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout(secs) => SyncError::Timeout(secs),
            FetchError::Parse(msg) => SyncError::MalformedFeed(msg),
            FetchError::InvalidUrl(e) => SyncError::Validation(e.to_string()),
            FetchError::RedirectRejected(msg) => SyncError::Validation(msg),
            other => SyncError::FeedUnreachable(other.to_string()),
        }
    }
}

impl From<DatabaseError> for SyncError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::InvalidQuery(msg) => SyncError::Validation(msg),
            other => SyncError::Server(other.to_string()),
        }
    }
}

impl From<UrlValidationError> for SyncError {
    fn from(err: UrlValidationError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_metadata_is_consistent() {
        let err = SyncError::DuplicateSubscription {
            url: "https://example.com/rss".into(),
        };
        assert_eq!(err.kind(), ErrorKind::DuplicateSubscription);
        assert_eq!(err.kind().code(), "4009");
        assert_eq!(err.kind().status(), 409);
    }

    #[test]
    fn test_fetch_timeout_maps_to_timeout_kind() {
        let err: SyncError = FetchError::Timeout(10).into();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.kind().is_retryable());
    }

    #[test]
    fn test_parse_error_is_not_retryable() {
        let err: SyncError = FetchError::Parse("no feed root".into()).into();
        assert_eq!(err.kind(), ErrorKind::MalformedFeed);
        assert!(!err.kind().is_retryable());
        assert_eq!(err.kind().status(), 502);
    }

    #[test]
    fn test_http_status_maps_to_unreachable() {
        let err: SyncError = FetchError::HttpStatus(404).into();
        assert_eq!(err.kind(), ErrorKind::FeedUnreachable);
        assert!(err.to_string().contains("404"));
    }

    #[test]
    fn test_rejected_redirect_maps_to_validation() {
        let err: SyncError = FetchError::RedirectRejected("Localhost not allowed".into()).into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.kind().status(), 422);
    }

    #[test]
    fn test_missing_group_is_a_not_found() {
        let kind = SyncError::GroupNotFound(7).kind();
        assert_eq!(kind, ErrorKind::GroupNotFound);
        assert_eq!((kind.code(), kind.status()), ("4004", 404));
        assert!(!kind.is_retryable());
    }

    #[test]
    fn test_invalid_query_maps_to_validation() {
        let err: SyncError = DatabaseError::InvalidQuery("bad field".into()).into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.kind().code(), "4022");
    }
}
