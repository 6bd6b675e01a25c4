//! Dedup & fan-out coordinator.
//!
//! Batch mode fetches each distinct enabled feed URL once per pass and fans
//! its entries out to every enabled subscription of that URL. On-demand mode
//! does the same for one owner's subscriptions and reports per-subscription
//! outcomes instead of only logging them.
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::feed::{FeedFetcher, ParsedFeed};
use crate::storage::{Database, DatabaseError, FanOut, Subscription};
use crate::util::clean_label;

/// Totals for one batch pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Distinct URLs attempted
    pub feeds: usize,
    pub feeds_failed: usize,
    pub subscriptions_synced: usize,
    pub subscriptions_failed: usize,
    pub entries_inserted: usize,
}

impl SyncReport {
    fn absorb(&mut self, url: UrlReport) {
        self.feeds += 1;
        if url.fetch_failed {
            self.feeds_failed += 1;
        }
        self.subscriptions_synced += url.synced;
        self.subscriptions_failed += url.failed;
        self.entries_inserted += url.inserted;
    }
}

#[derive(Debug, Default)]
struct UrlReport {
    fetch_failed: bool,
    synced: usize,
    failed: usize,
    inserted: usize,
}

/// Outcome of syncing one subscription on demand.
#[derive(Debug)]
pub struct SubscriptionSync {
    pub subscription_id: i64,
    pub url: String,
    pub result: Result<FanOut>,
}

/// Entry point for every synchronization path.
pub struct Syncer {
    db: Database,
    fetcher: FeedFetcher,
    max_concurrent_fetches: usize,
}

impl Syncer {
    pub fn new(db: Database, fetcher: FeedFetcher, config: &Config) -> Self {
        Self {
            db,
            fetcher,
            max_concurrent_fetches: config.max_concurrent_fetches.max(1),
        }
    }

    /// Open the configured database and build an HTTP client for it.
    pub async fn open(config: &Config) -> Result<Self> {
        let path = config.database_path.to_str().ok_or_else(|| {
            SyncError::validation(format!(
                "database path is not valid UTF-8: {}",
                config.database_path.display()
            ))
        })?;
        let db = Database::open(path)
            .await?
            .with_max_page_size(config.max_page_size);
        let fetcher = FeedFetcher::new(config)
            .map_err(|e| SyncError::Server(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self::new(db, fetcher, config))
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // ========================================================================
    // Batch mode
    // ========================================================================

    /// Synchronize every enabled subscription.
    ///
    /// Never fails: fetch errors are recorded on the affected subscriptions
    /// and logged, and one feed's failure never stops the others.
    pub async fn sync_all(&self) -> SyncReport {
        let urls = match self.db.distinct_enabled_urls().await {
            Ok(urls) => urls,
            Err(e) => {
                tracing::error!(error = %e, "Could not list feed URLs, skipping sync pass");
                return SyncReport::default();
            }
        };

        tracing::info!(feeds = urls.len(), "Sync pass started");

        let report = stream::iter(urls)
            .map(|url| async move { self.sync_url(&url).await })
            .buffer_unordered(self.max_concurrent_fetches)
            .fold(SyncReport::default(), |mut report, url| async move {
                report.absorb(url);
                report
            })
            .await;

        tracing::info!(
            feeds = report.feeds,
            feeds_failed = report.feeds_failed,
            subscriptions = report.subscriptions_synced,
            inserted = report.entries_inserted,
            "Sync pass finished"
        );
        report
    }

    /// Fetch one URL once and fan it out to all of its enabled subscribers.
    async fn sync_url(&self, url: &str) -> UrlReport {
        let mut report = UrlReport::default();
        let fetched = self.fetcher.fetch(url).await;

        let subscriptions = match self.db.get_enabled_subscriptions_for_url(url).await {
            Ok(subs) => subs,
            Err(e) => {
                tracing::error!(url = %url, error = %e, "Could not load subscribers");
                report.fetch_failed = fetched.is_err();
                return report;
            }
        };

        let parsed = match fetched {
            Ok(parsed) => parsed,
            Err(e) => {
                report.fetch_failed = true;
                report.failed = subscriptions.len();
                tracing::warn!(
                    url = %url,
                    subscribers = subscriptions.len(),
                    error = %e,
                    "Feed sync failed"
                );
                // Disabled subscribers see the failure too
                if let Err(db_err) = self.db.set_url_error(url, &e.to_string()).await {
                    tracing::warn!(url = %url, error = %db_err, "Failed to record feed error");
                }
                return report;
            }
        };

        // Subscribers' rows are disjoint, but they share the one fetch
        for subscription in &subscriptions {
            match self.fan_out(subscription, &parsed).await {
                Ok(Some(fan_out)) => {
                    report.synced += 1;
                    report.inserted += fan_out.inserted;
                }
                // Disabled or deleted since it was listed
                Ok(None) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        subscription_id = subscription.id,
                        url = %url,
                        error = %e,
                        "Fan-out failed"
                    );
                    self.record_error(subscription.id, &e.to_string()).await;
                }
            }
        }

        if report.inserted > 0 {
            tracing::info!(
                url = %url,
                inserted = report.inserted,
                subscribers = report.synced,
                "Feed synced"
            );
        } else {
            tracing::debug!(url = %url, subscribers = report.synced, "Feed synced, nothing new");
        }
        report
    }

    async fn fan_out(
        &self,
        subscription: &Subscription,
        parsed: &ParsedFeed,
    ) -> std::result::Result<Option<FanOut>, DatabaseError> {
        self.db
            .complete_subscription_sync(
                subscription.id,
                &parsed.descriptor,
                &parsed.entries,
                parsed.newest_published(),
            )
            .await
    }

    async fn record_error(&self, subscription_id: i64, message: &str) {
        if let Err(e) = self
            .db
            .batch_set_subscription_errors(&[subscription_id], message)
            .await
        {
            tracing::warn!(
                subscription_id = subscription_id,
                error = %e,
                "Failed to record sync error"
            );
        }
    }

    // ========================================================================
    // On-demand mode
    // ========================================================================

    /// Synchronize one owner's enabled subscriptions, one at a time.
    ///
    /// Each subscription is fetched by its own URL; failures are recorded on
    /// the subscription and returned in its [`SubscriptionSync`].
    ///
    /// # Errors
    ///
    /// Only if the owner's subscriptions cannot be listed.
    pub async fn sync_owner(&self, owner_id: &str) -> Result<Vec<SubscriptionSync>> {
        let subscriptions = self.db.get_owner_subscriptions(owner_id, true).await?;
        tracing::info!(
            owner = %owner_id,
            subscriptions = subscriptions.len(),
            "On-demand sync started"
        );

        let mut results = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let result = self.sync_one(&subscription).await;
            results.push(SubscriptionSync {
                subscription_id: subscription.id,
                url: subscription.url,
                result,
            });
        }

        let failed = results.iter().filter(|r| r.result.is_err()).count();
        tracing::info!(
            owner = %owner_id,
            synced = results.len() - failed,
            failed = failed,
            "On-demand sync finished"
        );
        Ok(results)
    }

    /// Synchronize a single subscription of `owner_id` now.
    pub async fn sync_subscription(&self, owner_id: &str, id: i64) -> Result<FanOut> {
        let subscription = self
            .db
            .get_subscription(owner_id, id)
            .await?
            .ok_or(SyncError::SubscriptionNotFound(id))?;
        if !subscription.updates_enabled {
            return Err(SyncError::validation("updates are disabled for this subscription"));
        }
        self.sync_one(&subscription).await
    }

    async fn sync_one(&self, subscription: &Subscription) -> Result<FanOut> {
        let parsed = match self.fetcher.fetch(&subscription.url).await {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(
                    subscription_id = subscription.id,
                    url = %subscription.url,
                    error = %e,
                    "Feed sync failed"
                );
                self.record_error(subscription.id, &e.to_string()).await;
                return Err(e.into());
            }
        };

        match self.fan_out(subscription, &parsed).await {
            Ok(Some(fan_out)) => Ok(fan_out),
            Ok(None) => Err(SyncError::SubscriptionNotFound(subscription.id)),
            Err(e) => {
                self.record_error(subscription.id, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // Subscribing
    // ========================================================================

    /// Subscribe `owner_id` to `url`.
    ///
    /// The feed is fetched and parsed once up front so an unreachable or
    /// malformed URL is rejected before anything is stored, and the
    /// subscription starts with the feed's metadata. Entries arrive on the
    /// next sync.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Validation`] - bad URL or blocked host
    /// - [`SyncError::DuplicateSubscription`] - owner already follows this URL
    /// - [`SyncError::Timeout`] / [`SyncError::FeedUnreachable`] / [`SyncError::MalformedFeed`]
    pub async fn add_subscription(
        &self,
        owner_id: &str,
        url: &str,
        display_title: Option<&str>,
    ) -> Result<Subscription> {
        let url = self.fetcher.check_url(url)?;
        let display_title = display_title.and_then(clean_label);

        if self
            .db
            .find_subscription_by_url(owner_id, url.as_str())
            .await?
            .is_some()
        {
            return Err(SyncError::DuplicateSubscription {
                url: url.to_string(),
            });
        }

        let parsed = self.fetcher.fetch(url.as_str()).await?;

        let subscription = self
            .db
            .insert_subscription(owner_id, &parsed.descriptor, display_title.as_deref())
            .await
            .map_err(|e| match e {
                // Lost a race with a concurrent add
                DatabaseError::Duplicate(_) => SyncError::DuplicateSubscription {
                    url: url.to_string(),
                },
                other => other.into(),
            })?;

        tracing::info!(
            owner = %owner_id,
            subscription_id = subscription.id,
            url = %subscription.url,
            entries_available = parsed.entries.len(),
            "Subscription added"
        );
        Ok(subscription)
    }

    /// Fetch and normalize a feed without storing anything.
    pub async fn preview_feed(&self, url: &str) -> Result<ParsedFeed> {
        Ok(self.fetcher.fetch(url).await?)
    }
}
