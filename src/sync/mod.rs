mod coordinator;
mod manage;
mod scheduler;

pub use coordinator::{SubscriptionSync, SyncReport, Syncer};
pub use scheduler::{FireOutcome, Scheduler, SchedulerStats};
