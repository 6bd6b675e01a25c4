use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{DatabaseError, NewTag, Tag};

const TAG_COLUMNS: &str = "id, owner_id, name, path, icon_type, icon_value, updated_at";

impl Database {
    // ========================================================================
    // Tag Operations
    // ========================================================================

    /// # Errors
    ///
    /// `DatabaseError::Duplicate` if the owner already has a tag with this name.
    pub async fn create_tag(&self, owner_id: &str, tag: &NewTag) -> Result<Tag, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            "INSERT INTO tags (owner_id, name, path, icon_type, icon_value, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING {}",
            TAG_COLUMNS
        );
        sqlx::query_as::<_, Tag>(&sql)
            .bind(owner_id)
            .bind(&tag.name)
            .bind(&tag.path)
            .bind(&tag.icon_type)
            .bind(&tag.icon_value)
            .bind(now)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    pub async fn rename_tag(
        &self,
        owner_id: &str,
        id: i64,
        name: &str,
    ) -> Result<Option<Tag>, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let sql = format!(
            "UPDATE tags SET name = ?, updated_at = ? WHERE owner_id = ? AND id = ? RETURNING {}",
            TAG_COLUMNS
        );
        sqlx::query_as::<_, Tag>(&sql)
            .bind(name)
            .bind(now)
            .bind(owner_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)
    }

    /// Delete a tag. Entries referencing it lose the reference.
    pub async fn delete_tag(&self, owner_id: &str, id: i64) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM tags WHERE owner_id = ? AND id = ?")
            .bind(owner_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_tags(&self, owner_id: &str) -> Result<Vec<Tag>, DatabaseError> {
        let sql = format!("SELECT {} FROM tags WHERE owner_id = ? ORDER BY name", TAG_COLUMNS);
        let tags = sqlx::query_as::<_, Tag>(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(tags)
    }

    pub async fn tags_for_entry(
        &self,
        owner_id: &str,
        entry_id: i64,
    ) -> Result<Vec<Tag>, DatabaseError> {
        let tags = sqlx::query_as::<_, Tag>(
            "SELECT t.id, t.owner_id, t.name, t.path, t.icon_type, t.icon_value, t.updated_at \
             FROM tags t JOIN entry_tags et ON et.tag_id = t.id \
             WHERE et.entry_id = ? AND t.owner_id = ? ORDER BY t.name",
        )
        .bind(entry_id)
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(tags)
    }

    /// Replace an entry's tag set.
    ///
    /// Tag ids not owned by `owner_id` are skipped. Returns `None` if the
    /// owner has no such entry.
    pub async fn set_entry_tags(
        &self,
        owner_id: &str,
        entry_id: i64,
        tag_ids: &[i64],
    ) -> Result<Option<Vec<Tag>>, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        // Claim the entry row (and the write lock) before touching the join table
        let now = chrono::Utc::now().timestamp();
        let claimed = sqlx::query("UPDATE entries SET updated_at = ? WHERE owner_id = ? AND id = ?")
            .bind(now)
            .bind(owner_id)
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        sqlx::query("DELETE FROM entry_tags WHERE entry_id = ?")
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;

        if !tag_ids.is_empty() {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("INSERT OR IGNORE INTO entry_tags (entry_id, tag_id) SELECT ");
            builder.push_bind(entry_id);
            builder.push(", id FROM tags WHERE owner_id = ");
            builder.push_bind(owner_id);
            builder.push(" AND id IN (");
            let mut separated = builder.separated(", ");
            for id in tag_ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        self.tags_for_entry(owner_id, entry_id).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewEntry;
    use pretty_assertions::assert_eq;

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn tag(name: &str) -> NewTag {
        NewTag {
            name: name.into(),
            ..Default::default()
        }
    }

    async fn entry_id(db: &Database, owner: &str) -> i64 {
        db.create_entry(
            owner,
            &NewEntry {
                feed_url: "https://example.com/rss".into(),
                title: Some("t".into()),
                published: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_create_and_list_tags() {
        let db = test_db().await;
        db.create_tag("alice", &tag("rust")).await.unwrap();
        db.create_tag("alice", &tag("async")).await.unwrap();
        db.create_tag("bob", &tag("go")).await.unwrap();

        let names: Vec<String> = db
            .list_tags("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["async", "rust"]);
    }

    #[tokio::test]
    async fn test_duplicate_tag_name_rejected() {
        let db = test_db().await;
        db.create_tag("alice", &tag("rust")).await.unwrap();
        let err = db.create_tag("alice", &tag("rust")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_rename_is_owner_scoped() {
        let db = test_db().await;
        let t = db.create_tag("alice", &tag("rust")).await.unwrap();
        assert!(db.rename_tag("bob", t.id, "mine").await.unwrap().is_none());
        let renamed = db.rename_tag("alice", t.id, "rustlang").await.unwrap().unwrap();
        assert_eq!(renamed.name, "rustlang");
    }

    #[tokio::test]
    async fn test_set_entry_tags_replaces_and_skips_foreign() {
        let db = test_db().await;
        let entry = entry_id(&db, "alice").await;
        let a = db.create_tag("alice", &tag("a")).await.unwrap();
        let b = db.create_tag("alice", &tag("b")).await.unwrap();
        let foreign = db.create_tag("bob", &tag("x")).await.unwrap();

        let tags = db
            .set_entry_tags("alice", entry, &[a.id, foreign.id])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tags, vec![a.clone()]);

        let tags = db
            .set_entry_tags("alice", entry, &[b.id])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].id, b.id);

        let result = db.set_entry_tags("bob", entry, &[foreign.id]).await;
        assert!(result.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_tag_clears_references() {
        let db = test_db().await;
        let entry = entry_id(&db, "alice").await;
        let t = db.create_tag("alice", &tag("a")).await.unwrap();
        db.set_entry_tags("alice", entry, &[t.id]).await.unwrap();

        assert!(db.delete_tag("alice", t.id).await.unwrap());
        assert!(db.tags_for_entry("alice", entry).await.unwrap().is_empty());
    }
}
