//! Paginated Query Engine.
//!
//! `find` translates a [`Filter`] and a [`PageRequest`] into two statements
//! over one [`Collection`]: a `COUNT(*)` for `total` and a page fetch. The two
//! run without a shared snapshot, so `total` may lag `items` under concurrent
//! writes.
//!
//! Ownership scoping is the caller's job: "my resources" listings add
//! [`Filter::owned_by`] themselves.
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, QueryBuilder, Sqlite};

use super::entries::ENTRY_COLUMNS;
use super::schema::Database;
use super::subscriptions::SUBSCRIPTION_COLUMNS;
use super::types::{DatabaseError, Entry, EntryDbRow, Subscription, SubscriptionDbRow, Tag};

// ============================================================================
// Collections
// ============================================================================

/// A table the query engine can page through.
///
/// Field names in filters and sorts are checked against the allow-lists
/// before they are spliced into SQL.
pub trait Collection: Sized + Send + Unpin {
    const TABLE: &'static str;
    const COLUMNS: &'static str;
    const FILTERABLE: &'static [&'static str];
    const SORTABLE: &'static [&'static str];
    const DEFAULT_SORT: &'static str;

    fn decode(row: &SqliteRow) -> Result<Self, sqlx::Error>;
}

impl Collection for Subscription {
    const TABLE: &'static str = "subscriptions";
    const COLUMNS: &'static str = SUBSCRIPTION_COLUMNS;
    const FILTERABLE: &'static [&'static str] = &[
        "id",
        "owner_id",
        "url",
        "title",
        "display_title",
        "link",
        "author",
        "subtitle",
        "version",
        "updates_enabled",
        "last_error",
        "newest_entry_pub_time",
        "created_at",
        "updated_at",
    ];
    const SORTABLE: &'static [&'static str] =
        &["id", "created_at", "updated_at", "newest_entry_pub_time", "title"];
    const DEFAULT_SORT: &'static str = "created_at";

    fn decode(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        SubscriptionDbRow::from_row(row).map(SubscriptionDbRow::into_subscription)
    }
}

impl Collection for Entry {
    const TABLE: &'static str = "entries";
    const COLUMNS: &'static str = ENTRY_COLUMNS;
    const FILTERABLE: &'static [&'static str] = &[
        "id",
        "subscription_id",
        "owner_id",
        "feed_url",
        "entry_key",
        "title",
        "link",
        "author",
        "summary",
        "published",
        "is_read",
        "read_later",
        "is_hide",
        "is_star",
        "read_modified",
        "read_later_modified",
        "hide_modified",
        "star_modified",
        "created_at",
        "updated_at",
    ];
    const SORTABLE: &'static [&'static str] = &[
        "id",
        "published",
        "created_at",
        "updated_at",
        "read_modified",
        "read_later_modified",
        "star_modified",
    ];
    const DEFAULT_SORT: &'static str = "published";

    fn decode(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        EntryDbRow::from_row(row).map(EntryDbRow::into_entry)
    }
}

impl Collection for Tag {
    const TABLE: &'static str = "tags";
    const COLUMNS: &'static str = "id, owner_id, name, path, icon_type, icon_value, updated_at";
    const FILTERABLE: &'static [&'static str] = &["id", "owner_id", "name", "path", "updated_at"];
    const SORTABLE: &'static [&'static str] = &["id", "name", "updated_at"];
    const DEFAULT_SORT: &'static str = "updated_at";

    fn decode(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Tag::from_row(row)
    }
}

// ============================================================================
// Filters
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl From<&str> for FilterValue {
    fn from(v: &str) -> Self {
        FilterValue::Text(v.to_owned())
    }
}

impl From<String> for FilterValue {
    fn from(v: String) -> Self {
        FilterValue::Text(v)
    }
}

impl From<i64> for FilterValue {
    fn from(v: i64) -> Self {
        FilterValue::Int(v)
    }
}

impl From<bool> for FilterValue {
    fn from(v: bool) -> Self {
        FilterValue::Bool(v)
    }
}

#[derive(Debug, Clone)]
enum Clause {
    Eq { field: String, value: FilterValue },
    Contains { fields: Vec<String>, needle: String },
    Range {
        field: String,
        start: Option<i64>,
        end: Option<i64>,
    },
}

/// Conjunction of clauses; an empty filter matches every row.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<Clause>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to rows owned by `owner_id`.
    pub fn owned_by(self, owner_id: impl Into<String>) -> Self {
        self.eq("owner_id", owner_id.into())
    }

    pub fn eq(mut self, field: &str, value: impl Into<FilterValue>) -> Self {
        self.clauses.push(Clause::Eq {
            field: field.to_owned(),
            value: value.into(),
        });
        self
    }

    pub fn flag(self, field: &str, set: bool) -> Self {
        self.eq(field, set)
    }

    /// Case-insensitive substring match, OR-ed across `fields`.
    /// A blank needle adds nothing.
    pub fn contains(mut self, fields: &[&str], needle: &str) -> Self {
        let needle = needle.trim();
        if needle.is_empty() || fields.is_empty() {
            return self;
        }
        self.clauses.push(Clause::Contains {
            fields: fields.iter().map(|f| (*f).to_owned()).collect(),
            needle: needle.to_owned(),
        });
        self
    }

    /// Inclusive range `start <= field <= end`; an open side is unbounded.
    pub fn range(mut self, field: &str, start: Option<i64>, end: Option<i64>) -> Self {
        if start.is_none() && end.is_none() {
            return self;
        }
        self.clauses.push(Clause::Range {
            field: field.to_owned(),
            start,
            end,
        });
        self
    }

    fn validate(&self, allowed: &[&str]) -> Result<(), DatabaseError> {
        let check = |field: &str| {
            if allowed.contains(&field) {
                Ok(())
            } else {
                Err(DatabaseError::InvalidQuery(format!("cannot filter on '{}'", field)))
            }
        };
        for clause in &self.clauses {
            match clause {
                Clause::Eq { field, .. } | Clause::Range { field, .. } => check(field)?,
                Clause::Contains { fields, .. } => {
                    for field in fields {
                        check(field)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Append ` WHERE ...` to `builder`. Fields must already be validated.
    fn push_where(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        let mut first = true;

        for clause in &self.clauses {
            match clause {
                Clause::Eq { field, value } => {
                    push_conjunction(builder, &mut first);
                    builder.push(field.as_str());
                    builder.push(" = ");
                    match value {
                        FilterValue::Text(v) => builder.push_bind(v.clone()),
                        FilterValue::Int(v) => builder.push_bind(*v),
                        FilterValue::Bool(v) => builder.push_bind(*v),
                    };
                }
                Clause::Contains { fields, needle } => {
                    push_conjunction(builder, &mut first);
                    let pattern = format!("%{}%", escape_like(needle));
                    builder.push("(");
                    for (i, field) in fields.iter().enumerate() {
                        if i > 0 {
                            builder.push(" OR ");
                        }
                        builder.push(field.as_str());
                        builder.push(" LIKE ");
                        builder.push_bind(pattern.clone());
                        builder.push(" ESCAPE '\\'");
                    }
                    builder.push(")");
                }
                Clause::Range { field, start, end } => {
                    if let Some(start) = start {
                        push_conjunction(builder, &mut first);
                        builder.push(field.as_str());
                        builder.push(" >= ");
                        builder.push_bind(*start);
                    }
                    if let Some(end) = end {
                        push_conjunction(builder, &mut first);
                        builder.push(field.as_str());
                        builder.push(" <= ");
                        builder.push_bind(*end);
                    }
                }
            }
        }
    }
}

fn push_conjunction(builder: &mut QueryBuilder<'_, Sqlite>, first: &mut bool) {
    builder.push(if *first { " WHERE " } else { " AND " });
    *first = false;
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// ============================================================================
// Pages
// ============================================================================

/// 1-based page request. `sort` defaults to the collection's default field;
/// ordering is always descending with `id DESC` as tie-break.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    pub sort: Option<String>,
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size,
            sort: None,
        }
    }

    pub fn sorted_by(mut self, field: &str) -> Self {
        self.sort = Some(field.to_owned());
        self
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    pub fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        (self.total.max(0) as u64).div_ceil(u64::from(self.page_size))
    }
}

impl Database {
    // ========================================================================
    // Query Engine
    // ========================================================================

    /// Fetch one page of `C` matching `filter`.
    ///
    /// `page_size` is capped at the configured maximum; the effective size is
    /// reported back in the returned [`Page`]. A page past the end yields no
    /// items with `total` unchanged.
    ///
    /// # Errors
    ///
    /// `DatabaseError::InvalidQuery` for page 0, page size 0, or a field outside
    /// the collection's allow-lists.
    pub async fn find<C: Collection>(
        &self,
        filter: &Filter,
        request: &PageRequest,
    ) -> Result<Page<C>, DatabaseError> {
        if request.page == 0 {
            return Err(DatabaseError::InvalidQuery("page numbers start at 1".into()));
        }
        if request.page_size == 0 {
            return Err(DatabaseError::InvalidQuery("page size must be positive".into()));
        }
        let sort = request.sort.as_deref().unwrap_or(C::DEFAULT_SORT);
        if !C::SORTABLE.contains(&sort) {
            return Err(DatabaseError::InvalidQuery(format!("cannot sort on '{}'", sort)));
        }
        filter.validate(C::FILTERABLE)?;

        let page_size = request.page_size.min(self.max_page_size);
        let offset = i64::from(request.page - 1) * i64::from(page_size);

        let mut count: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT COUNT(*) FROM {}", C::TABLE));
        filter.push_where(&mut count);
        let (total,): (i64,) = count.build_query_as::<(i64,)>().fetch_one(&self.pool).await?;

        let mut select: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM {}", C::COLUMNS, C::TABLE));
        filter.push_where(&mut select);
        select.push(format!(" ORDER BY {} DESC, id DESC LIMIT ", sort));
        select.push_bind(i64::from(page_size));
        select.push(" OFFSET ");
        select.push_bind(offset);

        let rows = select.build().fetch_all(&self.pool).await?;
        let items = rows.iter().map(C::decode).collect::<Result<Vec<_>, _>>()?;

        tracing::debug!(
            table = C::TABLE,
            sort = sort,
            page = request.page,
            page_size = page_size,
            total = total,
            returned = items.len(),
            "Query page fetched"
        );

        Ok(Page {
            items,
            total,
            page: request.page,
            page_size,
        })
    }
}
