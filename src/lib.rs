//! feedfan - multi-owner RSS/Atom sync engine.
//!
//! Feeds are fetched once per distinct URL, normalized, and fanned out to
//! every owner subscribed to them. Each subscription keeps a watermark so
//! only entries published after it are delivered, and each owner gets a
//! private copy of every entry.

pub mod config;
pub mod error;
pub mod feed;
pub mod storage;
pub mod sync;
pub mod util;

pub use config::{Config, ConfigError};
pub use error::{ErrorKind, Result, SyncError};
pub use feed::{FeedDescriptor, FeedFetcher, FetchError, NormalizedEntry, ParsedFeed};
pub use storage::{
    Database, DatabaseError, Entry, EntryStateUpdate, FanOut, FeedGroup, Filter, NewEntry,
    NewFeedGroup, NewTag, Page, PageRequest, Subscription, SubscriptionUpdate, Tag,
};
pub use sync::{FireOutcome, Scheduler, SubscriptionSync, SyncReport, Syncer};
