//! Composable, parameterized queries over the queue table.
//!
//! Queue reads and bulk writes express their conditions as an [`Expr`]
//! tree instead of hand-assembled SQL; rendering goes through
//! `sqlx::QueryBuilder` with every value bound, never interpolated.

use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use time::OffsetDateTime;

use super::item::QueueItem;

pub(crate) const TABLE: &str = "queue_items";

const COLUMNS: &str = "id, queue, parent_id, parent_queue_name, payload, attempts, \
     force_retry, reserved_at, completed_at, failed_at, created_at, updated_at";

/// A predicate over queue items.
///
/// Compound variants nest arbitrarily; an empty `All` matches everything
/// and an empty `Any` matches nothing.
#[derive(Debug, Clone)]
pub enum Expr {
    Reserved(bool),
    Completed(bool),
    Failed(bool),
    ForceRetrySet(bool),
    AttemptsBelow(i64),
    AttemptsAtLeast(i64),
    Id(i64),
    IdIn(Vec<i64>),
    Parent { queue: String, id: i64 },
    ReservedBefore(OffsetDateTime),
    UpdatedBefore(OffsetDateTime),
    All(Vec<Expr>),
    Any(Vec<Expr>),
}

impl Expr {
    /// Neither completed nor failed.
    pub fn active() -> Self {
        Expr::All(vec![Expr::Completed(false), Expr::Failed(false)])
    }

    /// Completed or failed.
    pub fn terminal() -> Self {
        Expr::Any(vec![Expr::Completed(true), Expr::Failed(true)])
    }

    /// Active, unreserved, and under the attempt ceiling or force-retried.
    pub fn claimable(max_attempts: i64) -> Self {
        Expr::All(vec![
            Expr::Completed(false),
            Expr::Failed(false),
            Expr::Reserved(false),
            Expr::Any(vec![
                Expr::AttemptsBelow(max_attempts),
                Expr::ForceRetrySet(true),
            ]),
        ])
    }

    /// Unreserved active items that have burned through their attempts
    /// without a force-retry override.
    pub fn exhausted(max_attempts: i64) -> Self {
        Expr::All(vec![
            Expr::Completed(false),
            Expr::Failed(false),
            Expr::Reserved(false),
            Expr::ForceRetrySet(false),
            Expr::AttemptsAtLeast(max_attempts),
        ])
    }

    /// Matches every item. Exists so that a full queue flush has to be
    /// spelled out at the call site.
    pub fn everything() -> Self {
        Expr::All(Vec::new())
    }

    pub(crate) fn push_sql(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        match self {
            Expr::Reserved(true) => {
                qb.push("reserved_at IS NOT NULL");
            }
            Expr::Reserved(false) => {
                qb.push("reserved_at IS NULL");
            }
            Expr::Completed(true) => {
                qb.push("completed_at IS NOT NULL");
            }
            Expr::Completed(false) => {
                qb.push("completed_at IS NULL");
            }
            Expr::Failed(true) => {
                qb.push("failed_at IS NOT NULL");
            }
            Expr::Failed(false) => {
                qb.push("failed_at IS NULL");
            }
            Expr::ForceRetrySet(set) => {
                qb.push("force_retry = ");
                qb.push_bind(*set);
            }
            Expr::AttemptsBelow(ceiling) => {
                qb.push("attempts < ");
                qb.push_bind(*ceiling);
            }
            Expr::AttemptsAtLeast(floor) => {
                qb.push("attempts >= ");
                qb.push_bind(*floor);
            }
            Expr::Id(id) => {
                qb.push("id = ");
                qb.push_bind(*id);
            }
            Expr::IdIn(ids) if ids.is_empty() => {
                qb.push("0 = 1");
            }
            Expr::IdIn(ids) => {
                qb.push("id IN (");
                let mut separated = qb.separated(", ");
                for id in ids {
                    separated.push_bind(*id);
                }
                qb.push(")");
            }
            Expr::Parent { queue, id } => {
                qb.push("(parent_queue_name = ");
                qb.push_bind(queue.clone());
                qb.push(" AND parent_id = ");
                qb.push_bind(*id);
                qb.push(")");
            }
            Expr::ReservedBefore(cutoff) => {
                qb.push("(reserved_at IS NOT NULL AND reserved_at < ");
                qb.push_bind(*cutoff);
                qb.push(")");
            }
            Expr::UpdatedBefore(cutoff) => {
                qb.push("updated_at < ");
                qb.push_bind(*cutoff);
            }
            Expr::All(exprs) if exprs.is_empty() => {
                qb.push("1 = 1");
            }
            Expr::All(exprs) => {
                Self::push_group(qb, exprs, " AND ");
            }
            Expr::Any(exprs) if exprs.is_empty() => {
                qb.push("0 = 1");
            }
            Expr::Any(exprs) => {
                Self::push_group(qb, exprs, " OR ");
            }
        }
    }

    fn push_group(qb: &mut QueryBuilder<'_, Sqlite>, exprs: &[Expr], joiner: &str) {
        qb.push("(");
        for (index, expr) in exprs.iter().enumerate() {
            if index > 0 {
                qb.push(joiner);
            }
            expr.push_sql(qb);
        }
        qb.push(")");
    }
}

/// Claim and read ordering within a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Most-recently-inserted first (the claim order).
    NewestFirst,
    OldestFirst,
}

/// A filter/order/limit query over one named queue, with terminal calls
/// returning rows, a count, or a delete tally.
#[derive(Debug, Clone)]
pub struct ItemQuery {
    queue: String,
    filter: Option<Expr>,
    order: Order,
    limit: Option<i64>,
}

impl ItemQuery {
    pub fn scoped(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            filter: None,
            order: Order::NewestFirst,
            limit: None,
        }
    }

    /// Replace the filter wholesale.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(expr);
        self
    }

    /// AND another predicate onto the current filter.
    pub fn and_where(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            None => expr,
            Some(Expr::All(mut exprs)) => {
                exprs.push(expr);
                Expr::All(exprs)
            }
            Some(previous) => Expr::All(vec![previous, expr]),
        });
        self
    }

    /// OR another predicate onto the current filter.
    pub fn or_where(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            None => expr,
            Some(Expr::Any(mut exprs)) => {
                exprs.push(expr);
                Expr::Any(exprs)
            }
            Some(previous) => Expr::Any(vec![previous, expr]),
        });
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub async fn fetch_all(&self, pool: &SqlitePool) -> Result<Vec<QueueItem>, sqlx::Error> {
        let mut qb = self.select_builder();
        qb.build_query_as::<QueueItem>().fetch_all(pool).await
    }

    pub async fn fetch_optional(&self, pool: &SqlitePool) -> Result<Option<QueueItem>, sqlx::Error> {
        let mut qb = self.select_builder();
        qb.build_query_as::<QueueItem>().fetch_optional(pool).await
    }

    pub async fn count(&self, pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {TABLE} WHERE queue = "));
        qb.push_bind(self.queue.clone());
        self.push_filter(&mut qb);
        qb.build_query_scalar::<i64>().fetch_one(pool).await
    }

    /// Delete every matching row. Order and limit do not apply.
    pub async fn delete(&self, pool: &SqlitePool) -> Result<u64, sqlx::Error> {
        let mut qb = QueryBuilder::new(format!("DELETE FROM {TABLE} WHERE queue = "));
        qb.push_bind(self.queue.clone());
        self.push_filter(&mut qb);
        let result = qb.build().execute(pool).await?;
        Ok(result.rows_affected())
    }

    fn push_filter(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        if let Some(filter) = &self.filter {
            qb.push(" AND ");
            filter.push_sql(qb);
        }
    }

    fn select_builder(&self) -> QueryBuilder<'static, Sqlite> {
        let mut qb = QueryBuilder::new(format!("SELECT {COLUMNS} FROM {TABLE} WHERE queue = "));
        qb.push_bind(self.queue.clone());
        self.push_filter(&mut qb);
        match self.order {
            Order::NewestFirst => qb.push(" ORDER BY created_at DESC, id DESC"),
            Order::OldestFirst => qb.push(" ORDER BY created_at ASC, id ASC"),
        };
        if let Some(limit) = self.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit);
        }
        qb
    }
}
