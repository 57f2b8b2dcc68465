//! The purge pipeline.
//!
//! A content change enqueues one object-queue item; a scheduled drain
//! expands it into URL-queue children; a second drain batches those to the
//! purge client. Parents complete once every child has finished, and each
//! tier retries independently up to the attempt ceiling.

mod drain;
mod expander;
mod jobs;
mod notifier;
mod queues;

pub use drain::{ExpandOutcome, GarbageCollector, ObjectDrain, UrlDrain, UrlDrainOutcome};
pub use expander::{ExpandError, Expander, TargetContributor};
pub use jobs::{ObjectJob, UrlJob};
pub use notifier::{ChangeNotifier, NotifyError};
pub use queues::{OBJECT_QUEUE_NAME, ObjectQueue, URL_QUEUE_NAME, UrlQueue};
