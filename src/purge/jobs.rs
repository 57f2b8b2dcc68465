//! Typed payloads for the two purge queues.
//!
//! Each queue's payload is a tagged union so drain logic pattern-matches
//! exhaustively instead of branching on a string discriminator. The JSON
//! form (`{"type": "post", "id": 7}`, `{"type": "purge-all"}`) is what the
//! queue table stores.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::domain::{EntityId, PurgeTarget, TargetKind};

/// Payload of an object-queue item: which content entity changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ObjectJob {
    /// A post-like entity changed.
    Post {
        id: EntityId,
        /// URL the change was observed at, when it differs from the
        /// canonical permalink (e.g. a purge triggered through a redirect).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        original_url: Option<Url>,
    },
    /// A taxonomy term changed.
    Term { id: EntityId },
    /// Invalidate the entire cache.
    PurgeAll,
}

impl ObjectJob {
    pub fn post(id: EntityId) -> Self {
        ObjectJob::Post {
            id,
            original_url: None,
        }
    }

    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload.clone())
    }
}

/// Payload of a URL-queue item: one concrete invalidation target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UrlJob {
    Url { url: String },
    Tag { tag: String },
    PurgeAll,
}

impl UrlJob {
    pub fn to_payload(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(payload.clone())
    }
}

impl From<PurgeTarget> for UrlJob {
    fn from(target: PurgeTarget) -> Self {
        match target.kind {
            TargetKind::Url => UrlJob::Url { url: target.value },
            TargetKind::Tag => UrlJob::Tag { tag: target.value },
        }
    }
}
