mod entries;
mod groups;
mod query;
mod schema;
mod subscriptions;
mod tags;
mod types;

pub use query::{Collection, Filter, FilterValue, Page, PageRequest};
pub use schema::Database;
pub use subscriptions::FanOut;
pub use types::{
    ContentBlock, DatabaseError, Enclosure, Entry, EntryStateUpdate, FeedGroup, Logo, NewEntry,
    NewFeedGroup, NewTag, Subscription, SubscriptionUpdate, Tag,
};
