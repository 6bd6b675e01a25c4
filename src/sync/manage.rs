//! Owner-scoped management of subscriptions, entries, tags and feed groups.
//!
//! Thin layer over [`Database`](crate::storage::Database): it sanitizes
//! owner input and turns storage misses into the matching [`SyncError`].
use super::coordinator::Syncer;
use crate::error::{Result, SyncError};
use crate::storage::{
    DatabaseError, Entry, EntryStateUpdate, FeedGroup, Filter, NewEntry, NewFeedGroup, NewTag,
    Page, PageRequest, Subscription, SubscriptionUpdate, Tag,
};
use crate::util::clean_label;

impl Syncer {
    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub async fn get_subscription(&self, owner_id: &str, id: i64) -> Result<Subscription> {
        self.database()
            .get_subscription(owner_id, id)
            .await?
            .ok_or(SyncError::SubscriptionNotFound(id))
    }

    /// Page through an owner's subscriptions. `filter` is narrowed to the owner.
    pub async fn list_subscriptions(
        &self,
        owner_id: &str,
        filter: Filter,
        request: &PageRequest,
    ) -> Result<Page<Subscription>> {
        Ok(self.database().find(&filter.owned_by(owner_id), request).await?)
    }

    /// Rename or enable/disable a subscription. The canonical feed title is
    /// left alone; only `display_title` changes.
    pub async fn update_subscription(
        &self,
        owner_id: &str,
        id: i64,
        update: SubscriptionUpdate,
    ) -> Result<Subscription> {
        let display_title = match update.display_title.as_deref() {
            Some(raw) => Some(
                clean_label(raw).ok_or_else(|| SyncError::validation("display title is empty"))?,
            ),
            None => None,
        };
        let update = SubscriptionUpdate {
            display_title,
            updates_enabled: update.updates_enabled,
        };

        self.database()
            .update_subscription(owner_id, id, &update)
            .await?
            .ok_or(SyncError::SubscriptionNotFound(id))
    }

    /// Remove a subscription. Entries already delivered stay with the owner.
    pub async fn delete_subscription(&self, owner_id: &str, id: i64) -> Result<()> {
        if !self.database().delete_subscription(owner_id, id).await? {
            return Err(SyncError::SubscriptionNotFound(id));
        }
        tracing::info!(owner = %owner_id, subscription_id = id, "Subscription deleted");
        Ok(())
    }

    /// Move a watermark explicitly; `None` makes the next sync deliver every
    /// entry in the document again (existing ones are not duplicated).
    pub async fn reset_watermark(
        &self,
        owner_id: &str,
        id: i64,
        to: Option<i64>,
    ) -> Result<Subscription> {
        if !self.database().reset_watermark(owner_id, id, to).await? {
            return Err(SyncError::SubscriptionNotFound(id));
        }
        tracing::info!(owner = %owner_id, subscription_id = id, watermark = ?to, "Watermark reset");
        self.get_subscription(owner_id, id).await
    }

    // ========================================================================
    // Entries
    // ========================================================================

    pub async fn create_entry(&self, owner_id: &str, new: NewEntry) -> Result<Entry> {
        let feed_url = new.feed_url.trim();
        if feed_url.is_empty() {
            return Err(SyncError::validation("feed_url is required"));
        }
        let new = NewEntry {
            feed_url: feed_url.to_owned(),
            title: new.title.as_deref().and_then(clean_label),
            ..new
        };
        Ok(self.database().create_entry(owner_id, &new).await?)
    }

    pub async fn get_entry(&self, owner_id: &str, id: i64) -> Result<Entry> {
        self.database()
            .get_entry(owner_id, id)
            .await?
            .ok_or(SyncError::EntryNotFound(id))
    }

    pub async fn list_entries(
        &self,
        owner_id: &str,
        filter: Filter,
        request: &PageRequest,
    ) -> Result<Page<Entry>> {
        Ok(self.database().find(&filter.owned_by(owner_id), request).await?)
    }

    pub async fn update_entry_state(
        &self,
        owner_id: &str,
        id: i64,
        update: EntryStateUpdate,
    ) -> Result<Entry> {
        self.database()
            .update_entry_state(owner_id, id, update)
            .await?
            .ok_or(SyncError::EntryNotFound(id))
    }

    pub async fn delete_entry(&self, owner_id: &str, id: i64) -> Result<()> {
        if !self.database().delete_entry(owner_id, id).await? {
            return Err(SyncError::EntryNotFound(id));
        }
        Ok(())
    }

    // ========================================================================
    // Tags
    // ========================================================================

    pub async fn create_tag(&self, owner_id: &str, tag: NewTag) -> Result<Tag> {
        let name =
            clean_label(&tag.name).ok_or_else(|| SyncError::validation("tag name is empty"))?;
        let tag = NewTag { name, ..tag };
        self.database()
            .create_tag(owner_id, &tag)
            .await
            .map_err(|e| duplicate_tag(e, &tag.name))
    }

    pub async fn rename_tag(&self, owner_id: &str, id: i64, name: &str) -> Result<Tag> {
        let name = clean_label(name).ok_or_else(|| SyncError::validation("tag name is empty"))?;
        self.database()
            .rename_tag(owner_id, id, &name)
            .await
            .map_err(|e| duplicate_tag(e, &name))?
            .ok_or(SyncError::TagNotFound(id))
    }

    /// Delete a tag; entries carrying it simply lose it.
    pub async fn delete_tag(&self, owner_id: &str, id: i64) -> Result<()> {
        if !self.database().delete_tag(owner_id, id).await? {
            return Err(SyncError::TagNotFound(id));
        }
        Ok(())
    }

    pub async fn list_tags(&self, owner_id: &str) -> Result<Vec<Tag>> {
        Ok(self.database().list_tags(owner_id).await?)
    }

    /// Tags on one of the owner's entries, by name.
    pub async fn entry_tags(&self, owner_id: &str, entry_id: i64) -> Result<Vec<Tag>> {
        self.get_entry(owner_id, entry_id).await?;
        Ok(self.database().tags_for_entry(owner_id, entry_id).await?)
    }

    /// Replace an entry's tags with `tag_ids`, all of which must be the owner's.
    pub async fn set_entry_tags(
        &self,
        owner_id: &str,
        entry_id: i64,
        tag_ids: &[i64],
    ) -> Result<Vec<Tag>> {
        let owned = self.database().list_tags(owner_id).await?;
        let is_owned = |id: &i64| owned.iter().any(|t| t.id == *id);
        if let Some(missing) = tag_ids.iter().find(|id| !is_owned(id)) {
            return Err(SyncError::TagNotFound(*missing));
        }

        self.database()
            .set_entry_tags(owner_id, entry_id, tag_ids)
            .await?
            .ok_or(SyncError::EntryNotFound(entry_id))
    }

    // ========================================================================
    // Feed Groups
    // ========================================================================

    pub async fn create_group(&self, owner_id: &str, group: NewFeedGroup) -> Result<FeedGroup> {
        let name =
            clean_label(&group.name).ok_or_else(|| SyncError::validation("group name is empty"))?;
        let group = NewFeedGroup { name, ..group };
        Ok(self.database().create_group(owner_id, &group).await?)
    }

    pub async fn rename_group(&self, owner_id: &str, id: i64, name: &str) -> Result<FeedGroup> {
        let name = clean_label(name).ok_or_else(|| SyncError::validation("group name is empty"))?;
        self.database()
            .rename_group(owner_id, id, &name)
            .await?
            .ok_or(SyncError::GroupNotFound(id))
    }

    /// Delete a group. The subscriptions in it are kept.
    pub async fn delete_group(&self, owner_id: &str, id: i64) -> Result<()> {
        if !self.database().delete_group(owner_id, id).await? {
            return Err(SyncError::GroupNotFound(id));
        }
        Ok(())
    }

    pub async fn list_groups(&self, owner_id: &str) -> Result<Vec<FeedGroup>> {
        Ok(self.database().list_groups(owner_id).await?)
    }

    pub async fn group_subscriptions(
        &self,
        owner_id: &str,
        group_id: i64,
    ) -> Result<Vec<Subscription>> {
        let owned = self.database().list_groups(owner_id).await?;
        if !owned.iter().any(|g| g.id == group_id) {
            return Err(SyncError::GroupNotFound(group_id));
        }
        Ok(self.database().subscriptions_for_group(owner_id, group_id).await?)
    }

    /// Replace a group's members with `subscription_ids`, all of which must be
    /// the owner's.
    pub async fn set_group_subscriptions(
        &self,
        owner_id: &str,
        group_id: i64,
        subscription_ids: &[i64],
    ) -> Result<Vec<Subscription>> {
        let owned = self.database().get_owner_subscriptions(owner_id, false).await?;
        let is_owned = |id: &i64| owned.iter().any(|s| s.id == *id);
        if let Some(missing) = subscription_ids.iter().find(|id| !is_owned(id)) {
            return Err(SyncError::SubscriptionNotFound(*missing));
        }

        self.database()
            .set_group_subscriptions(owner_id, group_id, subscription_ids)
            .await?
            .ok_or(SyncError::GroupNotFound(group_id))
    }
}

fn duplicate_tag(err: DatabaseError, name: &str) -> SyncError {
    match err {
        DatabaseError::Duplicate(_) => {
            SyncError::validation(format!("tag '{}' already exists", name))
        }
        other => other.into(),
    }
}
