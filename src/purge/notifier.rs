//! Content-change entry points.
//!
//! Calling code reports mutations here directly — an explicit call graph
//! instead of a hook bus. In queued mode a change becomes one object-queue
//! item and returns immediately; in immediate mode the same expansion and
//! purge run inline, with failures handled per the configured policy.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::client::{PurgeClient, PurgeClientError, PurgeRequest};
use crate::config::{OnImmediateFailure, PurgeMode, PurgeSettings};
use crate::domain::{EntityId, TargetKind, TargetSet};
use crate::queue::QueueError;

use super::expander::{ExpandError, Expander};
use super::jobs::ObjectJob;
use super::queues::ObjectQueue;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error(transparent)]
    Purge(#[from] PurgeClientError),
}

/// Explicit interface content-change detection calls into.
pub struct ChangeNotifier {
    settings: PurgeSettings,
    objects: Arc<ObjectQueue>,
    expander: Arc<Expander>,
    client: Arc<dyn PurgeClient>,
}

impl ChangeNotifier {
    pub fn new(
        settings: PurgeSettings,
        objects: Arc<ObjectQueue>,
        expander: Arc<Expander>,
        client: Arc<dyn PurgeClient>,
    ) -> Self {
        Self {
            settings,
            objects,
            expander,
            client,
        }
    }

    /// A post-like entity was created, updated, or deleted.
    pub async fn post_changed(&self, id: EntityId) -> Result<(), NotifyError> {
        self.dispatch(ObjectJob::post(id)).await
    }

    /// Like [`ChangeNotifier::post_changed`], recording the URL the change
    /// was observed at when it may differ from the canonical permalink.
    pub async fn post_changed_at(&self, id: EntityId, original_url: Url) -> Result<(), NotifyError> {
        self.dispatch(ObjectJob::Post {
            id,
            original_url: Some(original_url),
        })
        .await
    }

    /// A taxonomy term was created, updated, or deleted.
    pub async fn term_changed(&self, id: EntityId) -> Result<(), NotifyError> {
        self.dispatch(ObjectJob::Term { id }).await
    }

    /// Invalidate the entire cache.
    pub async fn purge_everything(&self) -> Result<(), NotifyError> {
        self.dispatch(ObjectJob::PurgeAll).await
    }

    async fn dispatch(&self, job: ObjectJob) -> Result<(), NotifyError> {
        match self.settings.mode {
            PurgeMode::Queued => {
                let item = self.objects.add(&job).await?;
                debug!(item_id = item.id, "content change enqueued");
                Ok(())
            }
            PurgeMode::Immediate => self.purge_now(job).await,
        }
    }

    async fn purge_now(&self, job: ObjectJob) -> Result<(), NotifyError> {
        match self.try_purge_now(&job).await {
            Ok(()) => Ok(()),
            Err(err) => match self.settings.on_immediate_failure {
                OnImmediateFailure::LogOnly => {
                    // Fail open: the content change itself already happened.
                    error!(error = %err, "immediate purge failed");
                    Ok(())
                }
                OnImmediateFailure::SurfaceToCaller => Err(err),
            },
        }
    }

    async fn try_purge_now(&self, job: &ObjectJob) -> Result<(), NotifyError> {
        if matches!(job, ObjectJob::PurgeAll) {
            self.client.purge(PurgeRequest::Everything).await?;
            return Ok(());
        }

        let targets = match self.expander.expand(job).await {
            Ok(targets) => targets,
            Err(err) if err.is_not_found() => {
                debug!(error = %err, "entity gone; nothing to purge");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        for request in requests_for(targets) {
            self.client.purge(request).await?;
        }
        Ok(())
    }
}

/// Split a target set into at most one URL batch and one tag batch.
fn requests_for(targets: TargetSet) -> Vec<PurgeRequest> {
    let mut urls = Vec::new();
    let mut tags = Vec::new();
    for target in targets {
        match target.kind {
            TargetKind::Url => urls.push(target.value),
            TargetKind::Tag => tags.push(target.value),
        }
    }
    let mut requests = Vec::new();
    if !urls.is_empty() {
        requests.push(PurgeRequest::Urls(urls));
    }
    if !tags.is_empty() {
        requests.push(PurgeRequest::Tags(tags));
    }
    requests
}
