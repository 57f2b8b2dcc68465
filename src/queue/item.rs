//! In-memory representation of one queue row.
//!
//! The item owns the lifecycle transition rules; all persistence goes
//! through the owning [`Queue`](super::Queue). Mutators only change
//! in-memory flags and timestamps and report whether the transition was
//! legal from the current state.

use serde_json::Value;
use time::OffsetDateTime;

/// Current UTC time truncated to whole seconds.
///
/// Whole-second timestamps keep the RFC 3339 text SQLite stores fixed-width,
/// so lexicographic comparison in SQL agrees with chronological order.
pub(crate) fn now_second() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

/// One unit of work in a named queue.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct QueueItem {
    pub id: i64,
    /// Name of the queue this item belongs to.
    pub queue: String,
    /// Cross-queue back-reference to the item that spawned this one.
    pub parent_id: Option<i64>,
    pub parent_queue_name: Option<String>,
    /// Opaque payload, interpreted only by the enqueuing/dequeuing tier.
    pub payload: Value,
    pub attempts: i64,
    /// Manual override making the item claimable past the attempt ceiling.
    pub force_retry: bool,
    pub reserved_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub failed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl QueueItem {
    /// A fresh, unpersisted item. The id is assigned on insert.
    pub(crate) fn new(queue: impl Into<String>, payload: Value, parent: Option<(&str, i64)>) -> Self {
        let now = now_second();
        Self {
            id: 0,
            queue: queue.into(),
            parent_id: parent.map(|(_, id)| id),
            parent_queue_name: parent.map(|(queue, _)| queue.to_string()),
            payload,
            attempts: 0,
            force_retry: false,
            reserved_at: None,
            completed_at: None,
            failed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved_at.is_some()
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Neither completed nor failed.
    pub fn is_active(&self) -> bool {
        !self.is_completed() && !self.is_failed()
    }

    /// Active, unreserved, and under the attempt ceiling (or force-retried).
    pub fn is_claimable(&self, max_attempts: i64) -> bool {
        self.is_active() && !self.is_reserved() && (self.attempts < max_attempts || self.force_retry)
    }

    /// Take the reservation. Returns false if already reserved or terminal.
    pub fn reserve(&mut self) -> bool {
        if self.is_reserved() || !self.is_active() {
            return false;
        }
        self.reserved_at = Some(now_second());
        self.touch();
        true
    }

    /// Give the reservation back. Returns false if not currently reserved.
    pub fn release(&mut self) -> bool {
        if !self.is_reserved() {
            return false;
        }
        self.reserved_at = None;
        self.touch();
        true
    }

    /// Mark the work finished. Completion implies a reservation, so an
    /// unreserved item is reserved as part of the transition. Returns false
    /// from a terminal state.
    pub fn complete(&mut self) -> bool {
        if !self.is_active() {
            return false;
        }
        if !self.is_reserved() {
            self.reserved_at = Some(now_second());
        }
        self.completed_at = Some(now_second());
        self.touch();
        true
    }

    /// Count one processing attempt.
    pub fn do_attempt(&mut self) {
        self.attempts += 1;
        self.touch();
    }

    /// Move to the terminal failed state. Returns false if already there.
    pub fn flag_as_failed(&mut self) -> bool {
        if self.is_failed() {
            return false;
        }
        self.failed_at = Some(now_second());
        self.touch();
        true
    }

    fn touch(&mut self) {
        self.updated_at = now_second();
    }
}
