//! The edge-cache purge client boundary.
//!
//! The URL drain batches queue items into a single [`PurgeRequest`] and
//! hands it to whatever client the deployment wires in (CDN API, reverse
//! proxy, test double). The contract is batch-atomic: a request succeeds or
//! fails as a whole, and a failed batch is released for retry rather than
//! failed outright.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PurgeClientError {
    #[error("purge request failed: {0}")]
    Request(String),
    #[error("purge request rejected by the edge: {0}")]
    Rejected(String),
}

impl PurgeClientError {
    pub fn request(err: impl std::fmt::Display) -> Self {
        Self::Request(err.to_string())
    }
}

/// A batched invalidation instruction for the edge cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeRequest {
    /// Invalidate these concrete URLs.
    Urls(Vec<String>),
    /// Invalidate everything carrying one of these surrogate keys.
    Tags(Vec<String>),
    /// Invalidate the entire cache.
    Everything,
}

impl PurgeRequest {
    /// Number of discrete targets the request names.
    pub fn target_count(&self) -> usize {
        match self {
            PurgeRequest::Urls(urls) => urls.len(),
            PurgeRequest::Tags(tags) => tags.len(),
            PurgeRequest::Everything => 1,
        }
    }
}

/// Client for the external cache-purge API.
#[async_trait]
pub trait PurgeClient: Send + Sync {
    async fn purge(&self, request: PurgeRequest) -> Result<(), PurgeClientError>;
}
