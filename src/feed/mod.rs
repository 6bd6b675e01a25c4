//! Feed retrieval and normalization.
//!
//! - [`fetcher`] - bounded HTTP retrieval; parsing is moved off the async workers
//! - [`parser`] - tolerant parsing with `feed-rs` and normalization into
//!   [`FeedDescriptor`] + [`NormalizedEntry`]
//!
//! One call to [`FeedFetcher::fetch`] corresponds to one remote document, no
//! matter how many owners subscribe to it.

mod fetcher;
mod parser;

pub use fetcher::{FeedFetcher, FetchError};
pub use parser::{parse_feed, FeedDescriptor, NormalizedEntry, ParseAnomaly, ParsedFeed};
pub(crate) use parser::generate_entry_key;
