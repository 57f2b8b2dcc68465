//! The persistent work queue.
//!
//! [`Queue`] is the only component that mutates persisted queue-item state.
//! Claiming is a single conditional update per item — claim succeeds only
//! if the row is still unreserved at update time — so overlapping drain
//! triggers never double-claim without any external locking. All other
//! operations are plain persistence calls; their only failure mode is the
//! store being unavailable, which propagates as [`QueueError`].

mod item;
mod query;

pub use item::QueueItem;
pub use query::{Expr, ItemQuery, Order};

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sqlx::{QueryBuilder, SqlitePool};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use item::now_second;
use query::TABLE;

/// Bound on claim re-selection under contention.
const CLAIM_ROUNDS: usize = 8;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("database timeout")]
    Timeout,
    #[error("queue payload is not serializable: {0}")]
    Payload(String),
}

impl QueueError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

pub fn map_sqlx_error(err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db)
            if db.message().contains("database is locked")
                || db.message().contains("database table is locked") =>
        {
            QueueError::Timeout
        }
        other => QueueError::from_persistence(other),
    }
}

/// Reference to a queue item by id or by handle.
///
/// Lifecycle operations re-resolve the id against their own queue; an id
/// belonging to another queue is a no-op, never a cross-queue mutation.
#[derive(Debug, Clone, Copy)]
pub struct ItemRef(i64);

impl ItemRef {
    pub fn id(self) -> i64 {
        self.0
    }
}

impl From<i64> for ItemRef {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<&QueueItem> for ItemRef {
    fn from(item: &QueueItem) -> Self {
        Self(item.id)
    }
}

/// Aggregate view of a queue for inspection surfaces.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStatus {
    pub total: i64,
    pub available: i64,
    pub reserved: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Counts from one garbage-collection pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcOutcome {
    /// Terminal items deleted past retention.
    pub deleted: u64,
    /// Stale reservations released back to claimable.
    pub released: u64,
}

/// CRUD and lifecycle operations over the items of one named queue.
#[derive(Clone)]
pub struct Queue {
    name: String,
    pool: SqlitePool,
    max_attempts: i64,
}

impl Queue {
    pub fn new(name: impl Into<String>, pool: SqlitePool, max_attempts: i64) -> Self {
        Self {
            name: name.into(),
            pool,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_attempts(&self) -> i64 {
        self.max_attempts
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new item, optionally linked to a parent in another queue.
    ///
    /// A parent reference pointing back into this same queue is dropped
    /// rather than rejected; the item is persisted unparented.
    pub async fn add(
        &self,
        payload: Value,
        parent: Option<(&str, i64)>,
    ) -> Result<QueueItem, QueueError> {
        let parent = match parent {
            Some((parent_queue, parent_id)) if parent_queue == self.name => {
                warn!(
                    queue = %self.name,
                    parent_id,
                    "same-queue parent reference dropped"
                );
                None
            }
            other => other,
        };

        let mut item = QueueItem::new(self.name.as_str(), payload, parent);
        let result = sqlx::query(
            "INSERT INTO queue_items (queue, parent_id, parent_queue_name, payload, attempts, \
             force_retry, reserved_at, completed_at, failed_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(item.queue.clone())
        .bind(item.parent_id)
        .bind(item.parent_queue_name.clone())
        .bind(item.payload.clone())
        .bind(item.attempts)
        .bind(item.force_retry)
        .bind(item.reserved_at)
        .bind(item.completed_at)
        .bind(item.failed_at)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        item.id = result.last_insert_rowid();
        debug!(queue = %self.name, item_id = item.id, "queue item added");
        Ok(item)
    }

    /// Read items without side effects, most-recent-first.
    pub async fn get_items(
        &self,
        limit: i64,
        only_unreserved: bool,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let mut query = ItemQuery::scoped(self.name.as_str()).limit(limit);
        if only_unreserved {
            query = query.filter(Expr::Reserved(false));
        }
        query.fetch_all(&self.pool).await.map_err(map_sqlx_error)
    }

    /// Claim up to `limit` items for exclusive processing.
    ///
    /// Selection and reservation are separate round trips, but each
    /// reservation is one conditional update that only succeeds if the row
    /// is still claimable. Candidates stolen by a racing worker drop out of
    /// the claimable view, so selection repeats until the limit is met or
    /// nothing claimable remains; two workers draining the same queue end
    /// up with disjoint batches covering every claimable item. With
    /// `do_attempt` the claim also counts a processing attempt.
    pub async fn get_and_reserve_items(
        &self,
        limit: i64,
        do_attempt: bool,
    ) -> Result<Vec<QueueItem>, QueueError> {
        let now = now_second();
        let mut claimed: Vec<i64> = Vec::new();
        for _ in 0..CLAIM_ROUNDS {
            let remaining = limit - claimed.len() as i64;
            if remaining <= 0 {
                break;
            }
            let candidates = ItemQuery::scoped(self.name.as_str())
                .filter(Expr::claimable(self.max_attempts))
                .limit(remaining)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            if candidates.is_empty() {
                break;
            }
            for candidate in &candidates {
                if self.try_claim(candidate.id, do_attempt, now).await? {
                    claimed.push(candidate.id);
                }
            }
        }
        if claimed.is_empty() {
            return Ok(Vec::new());
        }

        debug!(queue = %self.name, count = claimed.len(), "queue items claimed");
        ItemQuery::scoped(self.name.as_str())
            .filter(Expr::IdIn(claimed))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    /// Reserve a single item if it is still unreserved and active.
    pub async fn reserve_item(&self, item: impl Into<ItemRef>) -> Result<bool, QueueError> {
        let id = item.into().id();
        let now = now_second();
        let mut qb = QueryBuilder::new(format!("UPDATE {TABLE} SET reserved_at = "));
        qb.push_bind(now);
        qb.push(", updated_at = ");
        qb.push_bind(now);
        self.push_scope(&mut qb, id);
        qb.push(" AND ");
        Expr::All(vec![
            Expr::Reserved(false),
            Expr::Completed(false),
            Expr::Failed(false),
        ])
        .push_sql(&mut qb);
        let result = qb.build().execute(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }

    /// Release a reservation. Idempotent: an unreserved item yields false.
    pub async fn release_item(&self, item: impl Into<ItemRef>) -> Result<bool, QueueError> {
        let Some(mut item) = self.find_item(item.into().id()).await? else {
            return Ok(false);
        };
        if !item.release() {
            return Ok(false);
        }
        self.persist_state(&item, Expr::All(vec![Expr::Reserved(true), Expr::Completed(false)]))
            .await
    }

    /// Mark an item's work finished.
    pub async fn complete_item(&self, item: impl Into<ItemRef>) -> Result<bool, QueueError> {
        let Some(mut item) = self.find_item(item.into().id()).await? else {
            return Ok(false);
        };
        if !item.complete() {
            return Ok(false);
        }
        self.persist_state(&item, Expr::active()).await
    }

    /// Move an item to the terminal failed state.
    pub async fn set_item_as_failed(&self, item: impl Into<ItemRef>) -> Result<bool, QueueError> {
        let Some(mut item) = self.find_item(item.into().id()).await? else {
            return Ok(false);
        };
        if !item.flag_as_failed() {
            return Ok(false);
        }
        let flagged = self.persist_state(&item, Expr::Failed(false)).await?;
        if flagged {
            warn!(queue = %self.name, item_id = item.id, attempts = item.attempts, "queue item failed");
        }
        Ok(flagged)
    }

    /// Count one processing attempt against an item.
    pub async fn do_attempt(&self, item: impl Into<ItemRef>) -> Result<bool, QueueError> {
        let Some(mut item) = self.find_item(item.into().id()).await? else {
            return Ok(false);
        };
        if !item.is_active() {
            return Ok(false);
        }
        item.do_attempt();
        self.persist_state(&item, Expr::active()).await
    }

    /// Set or clear the manual retry override.
    pub async fn force_retry_item(
        &self,
        item: impl Into<ItemRef>,
        force: bool,
    ) -> Result<bool, QueueError> {
        let Some(mut item) = self.find_item(item.into().id()).await? else {
            return Ok(false);
        };
        if item.force_retry == force {
            return Ok(false);
        }
        item.force_retry = force;
        self.persist_state(&item, Expr::everything()).await
    }

    /// Flag attempts-exhausted, unreserved items as failed. Returns the
    /// number flagged.
    pub async fn flag_exhausted_items(&self) -> Result<u64, QueueError> {
        let now = now_second();
        let mut qb = QueryBuilder::new(format!("UPDATE {TABLE} SET failed_at = "));
        qb.push_bind(now);
        qb.push(", updated_at = ");
        qb.push_bind(now);
        qb.push(" WHERE queue = ");
        qb.push_bind(self.name.clone());
        qb.push(" AND ");
        Expr::exhausted(self.max_attempts).push_sql(&mut qb);
        let result = qb.build().execute(&self.pool).await.map_err(map_sqlx_error)?;
        let flagged = result.rows_affected();
        if flagged > 0 {
            warn!(queue = %self.name, flagged, "attempt-exhausted queue items flagged as failed");
        }
        Ok(flagged)
    }

    /// Items of this queue whose parent is the given item and which are
    /// neither completed nor failed.
    pub async fn get_unfinished_items_by_parent(
        &self,
        parent_id: i64,
        parent_queue_name: &str,
    ) -> Result<Vec<QueueItem>, QueueError> {
        ItemQuery::scoped(self.name.as_str())
            .filter(Expr::active())
            .and_where(Expr::Parent {
                queue: parent_queue_name.to_string(),
                id: parent_id,
            })
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    /// Currently reserved (and still active) items, most-recent-first.
    pub async fn get_reserved_items(&self, limit: i64) -> Result<Vec<QueueItem>, QueueError> {
        ItemQuery::scoped(self.name.as_str())
            .filter(Expr::active())
            .and_where(Expr::Reserved(true))
            .limit(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    pub async fn count_items(&self) -> Result<i64, QueueError> {
        self.count(None).await
    }

    pub async fn count_available_items(&self) -> Result<i64, QueueError> {
        self.count(Some(Expr::claimable(self.max_attempts))).await
    }

    pub async fn count_reserved_items(&self) -> Result<i64, QueueError> {
        self.count(Some(Expr::All(vec![
            Expr::Reserved(true),
            Expr::Completed(false),
            Expr::Failed(false),
        ])))
        .await
    }

    pub async fn count_completed_items(&self) -> Result<i64, QueueError> {
        self.count(Some(Expr::Completed(true))).await
    }

    pub async fn count_failed_items(&self) -> Result<i64, QueueError> {
        self.count(Some(Expr::Failed(true))).await
    }

    pub async fn has_items(&self) -> Result<bool, QueueError> {
        Ok(self.count_items().await? > 0)
    }

    pub async fn has_available(&self) -> Result<bool, QueueError> {
        Ok(self.count_available_items().await? > 0)
    }

    pub async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(!self.has_items().await?)
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        Ok(QueueStatus {
            total: self.count_items().await?,
            available: self.count_available_items().await?,
            reserved: self.count_reserved_items().await?,
            completed: self.count_completed_items().await?,
            failed: self.count_failed_items().await?,
        })
    }

    /// Bulk-delete the queue's active items. Completed and failed items
    /// survive; flushing those too requires [`Queue::clear_queue_matching`]
    /// with an explicit predicate.
    pub async fn clear_queue(&self) -> Result<u64, QueueError> {
        self.clear_queue_matching(Expr::active()).await
    }

    /// Bulk-delete items matching an explicit predicate
    /// (`Expr::everything()` flushes the whole queue).
    pub async fn clear_queue_matching(&self, expr: Expr) -> Result<u64, QueueError> {
        let removed = ItemQuery::scoped(self.name.as_str())
            .filter(expr)
            .delete(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        info!(queue = %self.name, removed, "queue cleared");
        Ok(removed)
    }

    /// Hard-remove a single item.
    pub async fn delete_item(&self, item: impl Into<ItemRef>) -> Result<bool, QueueError> {
        let removed = ItemQuery::scoped(self.name.as_str())
            .filter(Expr::Id(item.into().id()))
            .delete(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(removed == 1)
    }

    /// Hard-remove a batch of items.
    pub async fn delete_items(&self, items: &[QueueItem]) -> Result<u64, QueueError> {
        let ids: Vec<i64> = items
            .iter()
            .filter(|item| item.queue == self.name)
            .map(|item| item.id)
            .collect();
        if ids.is_empty() {
            return Ok(0);
        }
        ItemQuery::scoped(self.name.as_str())
            .filter(Expr::IdIn(ids))
            .delete(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    /// Delete terminal items older than `retention` and release
    /// reservations older than `stale_after`.
    pub async fn collect_garbage(
        &self,
        retention: Duration,
        stale_after: Duration,
    ) -> Result<GcOutcome, QueueError> {
        let now = now_second();

        let deleted = ItemQuery::scoped(self.name.as_str())
            .filter(Expr::terminal())
            .and_where(Expr::UpdatedBefore(now - retention))
            .delete(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut qb = QueryBuilder::new(format!("UPDATE {TABLE} SET reserved_at = NULL, updated_at = "));
        qb.push_bind(now);
        qb.push(" WHERE queue = ");
        qb.push_bind(self.name.clone());
        qb.push(" AND ");
        Expr::All(vec![
            Expr::Completed(false),
            Expr::Failed(false),
            Expr::ReservedBefore(now - stale_after),
        ])
        .push_sql(&mut qb);
        let released = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();

        let outcome = GcOutcome { deleted, released };
        if outcome.deleted > 0 || outcome.released > 0 {
            info!(
                queue = %self.name,
                deleted = outcome.deleted,
                released = outcome.released,
                "queue garbage collected"
            );
        }
        Ok(outcome)
    }

    async fn find_item(&self, id: i64) -> Result<Option<QueueItem>, QueueError> {
        ItemQuery::scoped(self.name.as_str())
            .filter(Expr::Id(id))
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)
    }

    async fn count(&self, filter: Option<Expr>) -> Result<i64, QueueError> {
        let mut query = ItemQuery::scoped(self.name.as_str());
        if let Some(filter) = filter {
            query = query.filter(filter);
        }
        query.count(&self.pool).await.map_err(map_sqlx_error)
    }

    /// Persist an item's in-memory state, guarded by a predicate over the
    /// stored row so a racing transition loses rather than clobbers.
    async fn persist_state(&self, item: &QueueItem, guard: Expr) -> Result<bool, QueueError> {
        let mut qb = QueryBuilder::new(format!("UPDATE {TABLE} SET attempts = "));
        qb.push_bind(item.attempts);
        qb.push(", force_retry = ");
        qb.push_bind(item.force_retry);
        qb.push(", reserved_at = ");
        qb.push_bind(item.reserved_at);
        qb.push(", completed_at = ");
        qb.push_bind(item.completed_at);
        qb.push(", failed_at = ");
        qb.push_bind(item.failed_at);
        qb.push(", updated_at = ");
        qb.push_bind(item.updated_at);
        self.push_scope(&mut qb, item.id);
        qb.push(" AND ");
        guard.push_sql(&mut qb);
        let result = qb.build().execute(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }

    /// One conditional update: claim succeeds only if the row is still
    /// claimable at update time.
    async fn try_claim(
        &self,
        id: i64,
        do_attempt: bool,
        now: OffsetDateTime,
    ) -> Result<bool, QueueError> {
        let mut qb = QueryBuilder::new(format!("UPDATE {TABLE} SET reserved_at = "));
        qb.push_bind(now);
        if do_attempt {
            qb.push(", attempts = attempts + 1");
        }
        qb.push(", updated_at = ");
        qb.push_bind(now);
        self.push_scope(&mut qb, id);
        qb.push(" AND ");
        Expr::claimable(self.max_attempts).push_sql(&mut qb);
        let result = qb.build().execute(&self.pool).await.map_err(map_sqlx_error)?;
        Ok(result.rows_affected() == 1)
    }

    fn push_scope(&self, qb: &mut QueryBuilder<'_, sqlx::Sqlite>, id: i64) {
        qb.push(" WHERE id = ");
        qb.push_bind(id);
        qb.push(" AND queue = ");
        qb.push_bind(self.name.clone());
    }
}
