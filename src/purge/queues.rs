//! The two purge tiers as typed facades over [`Queue`].
//!
//! The object queue records "this entity changed"; the URL queue records
//! the concrete targets expansion fanned those changes out into, each
//! parented to the object item that spawned it. Payload decoding happens
//! here so drain logic works with the typed unions; an undecodable payload
//! surfaces as `None` and is consumed by the drain rather than crashing it.

use sqlx::SqlitePool;
use tracing::warn;

use crate::queue::{Queue, QueueError, QueueItem};

use super::jobs::{ObjectJob, UrlJob};

pub const OBJECT_QUEUE_NAME: &str = "purge-objects";
pub const URL_QUEUE_NAME: &str = "purge-urls";

/// Top tier: entity-change events awaiting expansion.
#[derive(Clone)]
pub struct ObjectQueue {
    inner: Queue,
}

impl ObjectQueue {
    pub fn new(pool: SqlitePool, max_attempts: i64) -> Self {
        Self {
            inner: Queue::new(OBJECT_QUEUE_NAME, pool, max_attempts),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.inner
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Enqueue an entity-change event. Object items have no parent.
    pub async fn add(&self, job: &ObjectJob) -> Result<QueueItem, QueueError> {
        let payload = job
            .to_payload()
            .map_err(|err| QueueError::Payload(err.to_string()))?;
        self.inner.add(payload, None).await
    }

    /// Claim a batch for expansion, counting an attempt on each item.
    pub async fn claim(
        &self,
        limit: i64,
    ) -> Result<Vec<(QueueItem, Option<ObjectJob>)>, QueueError> {
        let items = self.inner.get_and_reserve_items(limit, true).await?;
        Ok(items.into_iter().map(decode_object).collect())
    }
}

/// Bottom tier: concrete invalidation targets awaiting the purge client.
#[derive(Clone)]
pub struct UrlQueue {
    inner: Queue,
}

impl UrlQueue {
    pub fn new(pool: SqlitePool, max_attempts: i64) -> Self {
        Self {
            inner: Queue::new(URL_QUEUE_NAME, pool, max_attempts),
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.inner
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Enqueue one target, parented to the object item that produced it.
    pub async fn add(&self, job: &UrlJob, parent: &QueueItem) -> Result<QueueItem, QueueError> {
        let payload = job
            .to_payload()
            .map_err(|err| QueueError::Payload(err.to_string()))?;
        self.inner
            .add(payload, Some((parent.queue.as_str(), parent.id)))
            .await
    }

    /// Claim a batch for purging, counting an attempt on each item.
    pub async fn claim(&self, limit: i64) -> Result<Vec<(QueueItem, Option<UrlJob>)>, QueueError> {
        let items = self.inner.get_and_reserve_items(limit, true).await?;
        Ok(items.into_iter().map(decode_url).collect())
    }

    /// Children of the given object item that are neither completed nor
    /// failed.
    pub async fn unfinished_children_of(
        &self,
        parent: &QueueItem,
    ) -> Result<Vec<QueueItem>, QueueError> {
        self.inner
            .get_unfinished_items_by_parent(parent.id, &parent.queue)
            .await
    }
}

fn decode_object(item: QueueItem) -> (QueueItem, Option<ObjectJob>) {
    match ObjectJob::from_payload(&item.payload) {
        Ok(job) => (item, Some(job)),
        Err(err) => {
            warn!(item_id = item.id, error = %err, "undecodable object-queue payload");
            (item, None)
        }
    }
}

fn decode_url(item: QueueItem) -> (QueueItem, Option<UrlJob>) {
    match UrlJob::from_payload(&item.payload) {
        Ok(job) => (item, Some(job)),
        Err(err) => {
            warn!(item_id = item.id, error = %err, "undecodable url-queue payload");
            (item, None)
        }
    }
}
