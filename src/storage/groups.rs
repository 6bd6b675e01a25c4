use sqlx::QueryBuilder;

use super::schema::Database;
use super::subscriptions::SUBSCRIPTION_COLUMNS;
use super::types::{DatabaseError, FeedGroup, NewFeedGroup, Subscription, SubscriptionDbRow};

const GROUP_COLUMNS: &str = "id, owner_id, name, icon_type, icon_value, updated_at";

impl Database {
    // ========================================================================
    // Feed Group Operations
    // ========================================================================

    pub async fn create_group(
        &self,
        owner_id: &str,
        group: &NewFeedGroup,
    ) -> Result<FeedGroup, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            "INSERT INTO feed_groups (owner_id, name, icon_type, icon_value, updated_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING {}",
            GROUP_COLUMNS
        );
        sqlx::query_as::<_, FeedGroup>(&sql)
            .bind(owner_id)
            .bind(&group.name)
            .bind(&group.icon_type)
            .bind(&group.icon_value)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    pub async fn rename_group(
        &self,
        owner_id: &str,
        id: i64,
        name: &str,
    ) -> Result<Option<FeedGroup>, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            "UPDATE feed_groups SET name = ?, updated_at = ? WHERE owner_id = ? AND id = ? \
             RETURNING {}",
            GROUP_COLUMNS
        );
        let group = sqlx::query_as::<_, FeedGroup>(&sql)
            .bind(name)
            .bind(now)
            .bind(owner_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(group)
    }

    /// Delete a group. Its subscriptions are untouched.
    pub async fn delete_group(&self, owner_id: &str, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM feed_groups WHERE owner_id = ? AND id = ?")
            .bind(owner_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_groups(&self, owner_id: &str) -> Result<Vec<FeedGroup>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM feed_groups WHERE owner_id = ? ORDER BY name, id",
            GROUP_COLUMNS
        );
        let groups = sqlx::query_as::<_, FeedGroup>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(groups)
    }

    /// Subscriptions filed under a group, oldest first.
    pub async fn subscriptions_for_group(
        &self,
        owner_id: &str,
        group_id: i64,
    ) -> Result<Vec<Subscription>, DatabaseError> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE owner_id = ? AND id IN \
             (SELECT subscription_id FROM group_subscriptions WHERE group_id = ?) ORDER BY id",
            SUBSCRIPTION_COLUMNS
        );
        let rows = sqlx::query_as::<_, SubscriptionDbRow>(&sql)
            .bind(owner_id)
            .bind(group_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(SubscriptionDbRow::into_subscription)
            .collect())
    }

    /// Replace a group's members.
    ///
    /// Subscription ids not owned by `owner_id` are skipped. Returns `None`
    /// if the owner has no such group.
    pub async fn set_group_subscriptions(
        &self,
        owner_id: &str,
        group_id: i64,
        subscription_ids: &[i64],
    ) -> Result<Option<Vec<Subscription>>, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let now = chrono::Utc::now().timestamp();
        let claimed =
            sqlx::query("UPDATE feed_groups SET updated_at = ? WHERE owner_id = ? AND id = ?")
                .bind(now)
                .bind(owner_id)
                .bind(group_id)
                .execute(&mut *tx)
                .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query("DELETE FROM group_subscriptions WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

        if !subscription_ids.is_empty() {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO group_subscriptions (group_id, subscription_id) SELECT ",
            );
            builder.push_bind(group_id);
            builder.push(", id FROM subscriptions WHERE owner_id = ");
            builder.push_bind(owner_id);
            builder.push(" AND id IN (");
            let mut separated = builder.separated(", ");
            for id in subscription_ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        self.subscriptions_for_group(owner_id, group_id)
            .await
            .map(Some)
    }
}
