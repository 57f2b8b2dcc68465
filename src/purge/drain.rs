//! Drain handlers: the scheduled entry points that advance the queues.
//!
//! An external scheduler invokes these on fixed intervals. Each handler is
//! short-lived, safe to run with nothing pending, and safe to run
//! concurrently with itself — exclusivity rests entirely on the queue's
//! conditional-update claims. Per-item problems (undecodable payloads, a
//! deleted entity) consume or release that item only; a persistence
//! failure aborts the invocation and the next trigger retries.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, info, instrument, warn};

use crate::client::{PurgeClient, PurgeRequest};
use crate::config::PurgeSettings;
use crate::queue::{GcOutcome, Queue, QueueError, QueueItem};

use super::expander::Expander;
use super::jobs::{ObjectJob, UrlJob};
use super::queues::{ObjectQueue, UrlQueue};

const METRIC_EXPAND_MS: &str = "spurgo_expand_drain_ms";
const METRIC_URL_DRAIN_MS: &str = "spurgo_url_drain_ms";
const METRIC_TARGETS_ENQUEUED: &str = "spurgo_targets_enqueued_total";
const METRIC_TARGETS_PURGED: &str = "spurgo_targets_purged_total";
const METRIC_PURGE_FAILURES: &str = "spurgo_purge_failures_total";

/// Completion sweeps look at most this many reserved parents per run.
const SWEEP_LIMIT: i64 = 500;

/// Tally of one expansion-drain invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpandOutcome {
    pub claimed: usize,
    pub expanded: usize,
    pub enqueued: usize,
    pub completed: usize,
    pub released: usize,
}

/// Expands claimed object-queue items into URL-queue children, then sweeps
/// reserved parents whose children have all finished.
pub struct ObjectDrain {
    objects: Arc<ObjectQueue>,
    urls: Arc<UrlQueue>,
    expander: Arc<Expander>,
    settings: PurgeSettings,
}

impl ObjectDrain {
    pub fn new(
        objects: Arc<ObjectQueue>,
        urls: Arc<UrlQueue>,
        expander: Arc<Expander>,
        settings: PurgeSettings,
    ) -> Self {
        Self {
            objects,
            urls,
            expander,
            settings,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<ExpandOutcome, QueueError> {
        let started_at = Instant::now();
        let mut outcome = ExpandOutcome::default();

        self.objects.queue().flag_exhausted_items().await?;

        let batch = self.objects.claim(self.settings.expand_batch).await?;
        outcome.claimed = batch.len();
        for (item, job) in batch {
            match job {
                None => {
                    // Nothing recognizable to purge; consume the item.
                    self.objects.queue().complete_item(&item).await?;
                    outcome.completed += 1;
                }
                Some(ObjectJob::PurgeAll) => {
                    self.urls.add(&UrlJob::PurgeAll, &item).await?;
                    outcome.enqueued += 1;
                }
                Some(job) => match self.expander.expand(&job).await {
                    Ok(targets) => {
                        outcome.expanded += 1;
                        for target in targets {
                            self.urls.add(&UrlJob::from(target), &item).await?;
                            outcome.enqueued += 1;
                        }
                    }
                    Err(err) if err.is_not_found() => {
                        debug!(item_id = item.id, error = %err, "entity gone; object item consumed");
                        self.objects.queue().complete_item(&item).await?;
                        outcome.completed += 1;
                    }
                    Err(err) => {
                        warn!(
                            item_id = item.id,
                            error = %err,
                            "expansion failed; object item released for retry"
                        );
                        self.objects.queue().release_item(&item).await?;
                        outcome.released += 1;
                    }
                },
            }
        }

        outcome.completed += self.complete_finished_parents().await?;

        counter!(METRIC_TARGETS_ENQUEUED).increment(outcome.enqueued as u64);
        histogram!(METRIC_EXPAND_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        if outcome.claimed > 0 || outcome.completed > 0 {
            info!(
                claimed = outcome.claimed,
                expanded = outcome.expanded,
                enqueued = outcome.enqueued,
                completed = outcome.completed,
                released = outcome.released,
                "object queue drained"
            );
        }
        Ok(outcome)
    }

    /// A reserved object item with zero unfinished children has nothing
    /// left in flight and may self-complete.
    async fn complete_finished_parents(&self) -> Result<usize, QueueError> {
        let mut completed = 0;
        for item in self.objects.queue().get_reserved_items(SWEEP_LIMIT).await? {
            let children = self.urls.unfinished_children_of(&item).await?;
            if children.is_empty() && self.objects.queue().complete_item(&item).await? {
                completed += 1;
            }
        }
        Ok(completed)
    }
}

/// Tally of one URL-drain invocation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UrlDrainOutcome {
    pub passes: u32,
    /// Targets the purge client acknowledged.
    pub purged: usize,
    pub completed: usize,
    pub released: usize,
}

/// Claims URL-queue batches and sends them to the purge client.
pub struct UrlDrain {
    urls: Arc<UrlQueue>,
    client: Arc<dyn PurgeClient>,
    settings: PurgeSettings,
}

impl UrlDrain {
    pub fn new(urls: Arc<UrlQueue>, client: Arc<dyn PurgeClient>, settings: PurgeSettings) -> Self {
        Self {
            urls,
            client,
            settings,
        }
    }

    /// Run up to `url_drain_passes` passes. A pass sequence ends early when
    /// the queue is empty or a purge call fails; retrying a failing edge
    /// within the same trigger would only burn attempts.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<UrlDrainOutcome, QueueError> {
        let started_at = Instant::now();
        let mut outcome = UrlDrainOutcome::default();

        self.urls.queue().flag_exhausted_items().await?;

        'passes: for _ in 0..self.settings.url_drain_passes {
            let batch = self.urls.claim(self.settings.purge_batch).await?;
            if batch.is_empty() {
                break;
            }
            outcome.passes += 1;

            let mut purge_all_items = Vec::new();
            let mut url_items = Vec::new();
            let mut url_values = Vec::new();
            let mut tag_items = Vec::new();
            let mut tag_values = Vec::new();
            for (item, job) in batch {
                match job {
                    None => {
                        self.urls.queue().complete_item(&item).await?;
                        outcome.completed += 1;
                    }
                    Some(UrlJob::PurgeAll) => purge_all_items.push(item),
                    Some(UrlJob::Url { url }) => {
                        url_items.push(item);
                        url_values.push(url);
                    }
                    Some(UrlJob::Tag { tag }) => {
                        tag_items.push(item);
                        tag_values.push(tag);
                    }
                }
            }

            if !purge_all_items.is_empty() {
                // Purging everything supersedes the rest of the batch.
                let mut members = purge_all_items;
                members.extend(url_items);
                members.extend(tag_items);
                if !self.send(PurgeRequest::Everything, &members, &mut outcome).await? {
                    break 'passes;
                }
                continue;
            }

            let mut failed = false;
            if !url_values.is_empty() {
                failed |= !self
                    .send(PurgeRequest::Urls(url_values), &url_items, &mut outcome)
                    .await?;
            }
            if !tag_values.is_empty() {
                failed |= !self
                    .send(PurgeRequest::Tags(tag_values), &tag_items, &mut outcome)
                    .await?;
            }
            if failed {
                break;
            }
        }

        histogram!(METRIC_URL_DRAIN_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        if outcome.passes > 0 {
            info!(
                passes = outcome.passes,
                purged = outcome.purged,
                completed = outcome.completed,
                released = outcome.released,
                "url queue drained"
            );
        }
        Ok(outcome)
    }

    /// One batched client call. The batch is atomic: success completes
    /// every member, failure releases every member for retry. Returns
    /// whether the call succeeded.
    async fn send(
        &self,
        request: PurgeRequest,
        members: &[QueueItem],
        outcome: &mut UrlDrainOutcome,
    ) -> Result<bool, QueueError> {
        let targets = request.target_count();
        match self.client.purge(request).await {
            Ok(()) => {
                for item in members {
                    self.urls.queue().complete_item(item).await?;
                }
                outcome.purged += targets;
                outcome.completed += members.len();
                counter!(METRIC_TARGETS_PURGED).increment(targets as u64);
                Ok(true)
            }
            Err(err) => {
                warn!(
                    error = %err,
                    members = members.len(),
                    "purge call failed; batch released for retry"
                );
                counter!(METRIC_PURGE_FAILURES).increment(1);
                for item in members {
                    self.urls.queue().release_item(item).await?;
                }
                outcome.released += members.len();
                Ok(false)
            }
        }
    }
}

/// Deletes terminal items past retention and releases stale reservations,
/// across both purge tiers.
pub struct GarbageCollector {
    queues: Vec<Queue>,
    settings: PurgeSettings,
}

impl GarbageCollector {
    pub fn new(objects: &ObjectQueue, urls: &UrlQueue, settings: PurgeSettings) -> Self {
        Self {
            queues: vec![objects.queue().clone(), urls.queue().clone()],
            settings,
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<GcOutcome, QueueError> {
        let mut total = GcOutcome::default();
        for queue in &self.queues {
            let outcome = queue
                .collect_garbage(
                    self.settings.gc_retention(),
                    self.settings.stale_reservation(),
                )
                .await?;
            total.deleted += outcome.deleted;
            total.released += outcome.released;
        }
        Ok(total)
    }
}
