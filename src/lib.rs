//! Spurgo: edge-cache invalidation orchestration for content-managed sites.
//!
//! When content changes, the edge cache has to be told exactly which URLs
//! (or cache tags) went stale — without blocking the content change on
//! network calls, and without losing or duplicating work under partial
//! failures. Spurgo does this with a persistent two-tier work queue:
//!
//! - the **object queue** records *what changed* (a post, a term, or
//!   "purge everything");
//! - a scheduled drain expands each change into its full cache footprint —
//!   the entity's page, the front page, every paginated archive it appears
//!   in — and persists the result as **URL-queue** items parented to the
//!   originating change;
//! - a second drain batches URL items into purge-client calls, retrying
//!   transient failures up to an attempt ceiling.
//!
//! The host application implements [`content::ContentRepo`] and
//! [`client::PurgeClient`], wires the pieces together at startup, and
//! invokes the drains from its scheduler.

pub mod client;
pub mod config;
pub mod content;
pub mod domain;
pub mod infra;
pub mod purge;
pub mod queue;
