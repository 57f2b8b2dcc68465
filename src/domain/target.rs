//! Purge targets and the deduplicating set expansion accumulates into.

use std::collections::HashSet;

use url::Url;

/// How a target is addressed at the edge cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// A concrete URL to invalidate.
    Url,
    /// A surrogate-key/cache-tag header value.
    Tag,
}

/// One cache-invalidation target produced by expansion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PurgeTarget {
    pub kind: TargetKind,
    pub value: String,
}

impl PurgeTarget {
    pub fn url(url: &Url) -> Self {
        Self {
            kind: TargetKind::Url,
            value: url.to_string(),
        }
    }

    pub fn tag(tag: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Tag,
            value: tag.into(),
        }
    }
}

/// Insertion-ordered set of purge targets.
///
/// A single expansion visits the same URL from several directions (the
/// front page is also page one of an archive, a term archive overlaps the
/// post-type archive); the set keeps the first occurrence and drops the
/// rest.
#[derive(Debug, Default)]
pub struct TargetSet {
    targets: Vec<PurgeTarget>,
    seen: HashSet<PurgeTarget>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a target, returning false if it was already present.
    pub fn insert(&mut self, target: PurgeTarget) -> bool {
        if !self.seen.insert(target.clone()) {
            return false;
        }
        self.targets.push(target);
        true
    }

    pub fn add_url(&mut self, url: &Url) -> bool {
        self.insert(PurgeTarget::url(url))
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) -> bool {
        self.insert(PurgeTarget::tag(tag))
    }

    pub fn extend(&mut self, targets: impl IntoIterator<Item = PurgeTarget>) {
        for target in targets {
            self.insert(target);
        }
    }

    pub fn contains(&self, target: &PurgeTarget) -> bool {
        self.seen.contains(target)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PurgeTarget> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn into_vec(self) -> Vec<PurgeTarget> {
        self.targets
    }
}

impl IntoIterator for TargetSet {
    type Item = PurgeTarget;
    type IntoIter = std::vec::IntoIter<PurgeTarget>;

    fn into_iter(self) -> Self::IntoIter {
        self.targets.into_iter()
    }
}
