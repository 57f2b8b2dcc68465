//! Purge-object expansion.
//!
//! Turns one changed entity into the deduplicated set of cache targets
//! that render it: its own page, the front page, and every paginated
//! archive it appears in. Only the entity lookup itself is fatal; an
//! archive branch that cannot be resolved contributes nothing and the
//! rest of the expansion proceeds.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::config::PurgeSettings;
use crate::content::{ContentError, ContentRepo, archive_page_url};
use crate::domain::{
    ArchiveFilter, DatePeriod, EntityId, EntityKind, PostInfo, PurgeTarget, TargetSet,
};

use super::jobs::ObjectJob;

#[derive(Debug, Error)]
pub enum ExpandError {
    /// The entity does not resolve; there is nothing left to purge for it.
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: EntityId },
    /// The content repository failed; the expansion can be retried.
    #[error(transparent)]
    Content(#[from] ContentError),
}

impl ExpandError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExpandError::NotFound { .. })
    }
}

/// Extension point: collaborators appending their own targets to an
/// expansion (shop pages, feeds). Contributions are unioned into the
/// result, not special-cased.
#[async_trait]
pub trait TargetContributor: Send + Sync {
    async fn contribute(&self, job: &ObjectJob) -> Vec<PurgeTarget>;
}

/// Computes the cache footprint of a changed entity.
pub struct Expander {
    content: Arc<dyn ContentRepo>,
    settings: PurgeSettings,
    contributors: Vec<Arc<dyn TargetContributor>>,
}

impl Expander {
    pub fn new(content: Arc<dyn ContentRepo>, settings: PurgeSettings) -> Self {
        Self {
            content,
            settings,
            contributors: Vec::new(),
        }
    }

    pub fn with_contributor(mut self, contributor: Arc<dyn TargetContributor>) -> Self {
        self.contributors.push(contributor);
        self
    }

    /// Expand an object-queue job into its target set.
    ///
    /// `PurgeAll` is handled by the drain before expansion is reached and
    /// enumerates nothing here.
    pub async fn expand(&self, job: &ObjectJob) -> Result<TargetSet, ExpandError> {
        match job {
            ObjectJob::Post { id, original_url } => {
                self.expand_post(*id, original_url.as_ref()).await
            }
            ObjectJob::Term { id } => self.expand_term(*id).await,
            ObjectJob::PurgeAll => Ok(TargetSet::new()),
        }
    }

    pub async fn expand_post(
        &self,
        id: EntityId,
        original_url: Option<&Url>,
    ) -> Result<TargetSet, ExpandError> {
        let post = self
            .content
            .post(id)
            .await?
            .ok_or(ExpandError::NotFound {
                kind: EntityKind::Post,
                id,
            })?;

        let mut targets = if self.settings.tag_mode {
            self.post_tags(&post).await
        } else {
            self.post_urls(&post, original_url).await
        };

        let job = ObjectJob::Post {
            id,
            original_url: original_url.cloned(),
        };
        for contributor in &self.contributors {
            targets.extend(contributor.contribute(&job).await);
        }

        debug!(post_id = id, targets = targets.len(), "post expanded");
        Ok(targets)
    }

    pub async fn expand_term(&self, id: EntityId) -> Result<TargetSet, ExpandError> {
        let term = self
            .content
            .term(id)
            .await?
            .ok_or(ExpandError::NotFound {
                kind: EntityKind::Term,
                id,
            })?;

        let mut targets = TargetSet::new();
        if self.settings.tag_mode {
            targets.add_tag(format!("term:{}", term.id));
            targets.add_tag("home");
        } else {
            self.add_paginated(
                &mut targets,
                Ok(Some(term.url.clone())),
                ArchiveFilter::for_term(term.id),
                "term archive",
            )
            .await;
            self.add_home(&mut targets).await;
        }

        let job = ObjectJob::Term { id };
        for contributor in &self.contributors {
            targets.extend(contributor.contribute(&job).await);
        }

        debug!(term_id = id, targets = targets.len(), "term expanded");
        Ok(targets)
    }

    /// URL-mode expansion of a resolved post.
    async fn post_urls(&self, post: &PostInfo, original_url: Option<&Url>) -> TargetSet {
        let mut targets = TargetSet::new();
        targets.add_url(&post.url);

        // A purge can be triggered through a URL the permalink generator no
        // longer produces; the cache may still hold it.
        if let Some(original) = original_url {
            if original != &post.url {
                targets.add_url(original);
            }
        }

        self.add_home(&mut targets).await;

        self.add_paginated(
            &mut targets,
            self.content.post_type_archive_url(&post.post_type).await,
            ArchiveFilter::for_post_type(post.post_type.clone()),
            "post-type archive",
        )
        .await;

        self.add_paginated(
            &mut targets,
            self.content.author_archive_url(post.author_id).await,
            ArchiveFilter::for_author(post.author_id, post.post_type.clone()),
            "author archive",
        )
        .await;

        match self.content.taxonomies_for(&post.post_type).await {
            Ok(taxonomies) => {
                for taxonomy in taxonomies {
                    if !taxonomy.public {
                        continue;
                    }
                    match self.content.terms_for_post(post.id, &taxonomy.name).await {
                        Ok(terms) => {
                            for term in terms {
                                self.add_paginated(
                                    &mut targets,
                                    Ok(Some(term.url.clone())),
                                    ArchiveFilter::for_term(term.id),
                                    "term archive",
                                )
                                .await;
                            }
                        }
                        Err(err) => {
                            warn!(
                                post_id = post.id,
                                taxonomy = %taxonomy.name,
                                error = %err,
                                "term lookup failed; taxonomy branch skipped"
                            );
                        }
                    }
                }
            }
            Err(err) => {
                warn!(post_id = post.id, error = %err, "taxonomy lookup failed; branch skipped");
            }
        }

        if self.settings.purge_date_archives {
            for period in DatePeriod::containing(post.published_on) {
                self.add_paginated(
                    &mut targets,
                    self.content.date_archive_url(&period).await,
                    ArchiveFilter::for_date(period),
                    "date archive",
                )
                .await;
            }
        }

        if post.is_attachment {
            match self.content.attachment_urls(post.id).await {
                Ok(urls) => {
                    for url in &urls {
                        targets.add_url(url);
                    }
                }
                Err(err) => {
                    warn!(post_id = post.id, error = %err, "attachment variants unresolved; branch skipped");
                }
            }
        }

        targets
    }

    /// Tag-mode expansion: a small fixed set the edge is expected to have
    /// attached to all relevant responses at serve time.
    async fn post_tags(&self, post: &PostInfo) -> TargetSet {
        let mut targets = TargetSet::new();
        targets.add_tag(format!("post-type:{}", post.post_type));
        targets.add_tag(format!("author:{}", post.author_id));

        match self.content.taxonomies_for(&post.post_type).await {
            Ok(taxonomies) => {
                for taxonomy in taxonomies.iter().filter(|taxonomy| taxonomy.public) {
                    match self.content.terms_for_post(post.id, &taxonomy.name).await {
                        Ok(terms) => {
                            for term in terms {
                                targets.add_tag(format!("term:{}", term.id));
                            }
                        }
                        Err(err) => {
                            warn!(
                                post_id = post.id,
                                taxonomy = %taxonomy.name,
                                error = %err,
                                "term lookup failed; taxonomy tags skipped"
                            );
                        }
                    }
                }
            }
            Err(err) => {
                warn!(post_id = post.id, error = %err, "taxonomy lookup failed; term tags skipped");
            }
        }

        targets.add_tag(format!(
            "date:{}-{:02}",
            post.published_on.year(),
            u8::from(post.published_on.month())
        ));
        targets.add_tag("home");
        targets
    }

    async fn add_home(&self, targets: &mut TargetSet) {
        match self.content.home_url().await {
            Ok(home) => {
                targets.add_url(&home);
            }
            Err(err) => {
                warn!(error = %err, "front page unresolved; branch skipped");
            }
        }
    }

    /// Add every page of an archive. An unresolved link or failed count
    /// skips the branch; a zero page count means nothing is cacheable.
    async fn add_paginated(
        &self,
        targets: &mut TargetSet,
        base: Result<Option<Url>, ContentError>,
        filter: ArchiveFilter,
        branch: &str,
    ) {
        let base = match base {
            Ok(Some(url)) => url,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, branch, "archive link unresolved; branch skipped");
                return;
            }
        };
        let pages = match self.content.archive_page_count(&filter).await {
            Ok(pages) => pages,
            Err(err) => {
                warn!(error = %err, branch, "page count failed; branch skipped");
                return;
            }
        };
        for page in 1..=pages {
            targets.add_url(&archive_page_url(&base, page));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use time::macros::date;

    use crate::domain::{TaxonomyInfo, TermInfo};

    use super::*;

    /// In-memory content fixture: one site, a handful of posts and terms.
    #[derive(Default)]
    struct FixtureContent {
        posts: HashMap<EntityId, PostInfo>,
        terms: HashMap<EntityId, TermInfo>,
        taxonomies: Vec<TaxonomyInfo>,
        post_terms: HashMap<(EntityId, String), Vec<EntityId>>,
        page_counts: HashMap<ArchiveFilterKey, u32>,
        attachment_urls: Vec<Url>,
        fail_post_type_archive: bool,
        count_queries: Mutex<Vec<ArchiveFilter>>,
    }

    /// Hashable projection of [`ArchiveFilter`] for fixture lookups.
    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum ArchiveFilterKey {
        PostType(String),
        Author(EntityId),
        Term(EntityId),
        Date,
    }

    impl ArchiveFilterKey {
        fn of(filter: &ArchiveFilter) -> Self {
            if let Some(term_id) = filter.term_id {
                ArchiveFilterKey::Term(term_id)
            } else if let Some(author_id) = filter.author_id {
                ArchiveFilterKey::Author(author_id)
            } else if filter.date.is_some() {
                ArchiveFilterKey::Date
            } else {
                ArchiveFilterKey::PostType(filter.post_type.clone().unwrap_or_default())
            }
        }
    }

    #[async_trait]
    impl ContentRepo for FixtureContent {
        async fn post(&self, id: EntityId) -> Result<Option<PostInfo>, ContentError> {
            Ok(self.posts.get(&id).cloned())
        }

        async fn term(&self, id: EntityId) -> Result<Option<TermInfo>, ContentError> {
            Ok(self.terms.get(&id).cloned())
        }

        async fn home_url(&self) -> Result<Url, ContentError> {
            Ok(url("https://example.com/"))
        }

        async fn post_type_archive_url(
            &self,
            post_type: &str,
        ) -> Result<Option<Url>, ContentError> {
            if self.fail_post_type_archive {
                return Err(ContentError::repository("archive link lookup failed"));
            }
            Ok(Some(url(&format!("https://example.com/{post_type}/"))))
        }

        async fn author_archive_url(
            &self,
            author_id: EntityId,
        ) -> Result<Option<Url>, ContentError> {
            Ok(Some(url(&format!(
                "https://example.com/author/{author_id}/"
            ))))
        }

        async fn date_archive_url(&self, period: &DatePeriod) -> Result<Option<Url>, ContentError> {
            let path = match period {
                DatePeriod::Year { year } => format!("{year}"),
                DatePeriod::Month { year, month } => format!("{year}/{month:02}"),
                DatePeriod::Day { year, month, day } => format!("{year}/{month:02}/{day:02}"),
            };
            Ok(Some(url(&format!("https://example.com/{path}/"))))
        }

        async fn taxonomies_for(&self, _post_type: &str) -> Result<Vec<TaxonomyInfo>, ContentError> {
            Ok(self.taxonomies.clone())
        }

        async fn terms_for_post(
            &self,
            post_id: EntityId,
            taxonomy: &str,
        ) -> Result<Vec<TermInfo>, ContentError> {
            let ids = self
                .post_terms
                .get(&(post_id, taxonomy.to_string()))
                .cloned()
                .unwrap_or_default();
            Ok(ids
                .into_iter()
                .filter_map(|id| self.terms.get(&id).cloned())
                .collect())
        }

        async fn archive_page_count(&self, filter: &ArchiveFilter) -> Result<u32, ContentError> {
            self.count_queries
                .lock()
                .expect("fixture lock")
                .push(filter.clone());
            let key = ArchiveFilterKey::of(filter);
            Ok(self.page_counts.get(&key).copied().unwrap_or(1))
        }

        async fn attachment_urls(&self, _id: EntityId) -> Result<Vec<Url>, ContentError> {
            Ok(self.attachment_urls.clone())
        }
    }

    fn url(value: &str) -> Url {
        value.parse().expect("valid url")
    }

    fn post(id: EntityId) -> PostInfo {
        PostInfo {
            id,
            url: url(&format!("https://example.com/posts/{id}/")),
            post_type: "post".to_string(),
            author_id: 5,
            published_on: date!(2024 - 03 - 09),
            is_attachment: false,
        }
    }

    fn term(id: EntityId, taxonomy: &str) -> TermInfo {
        TermInfo {
            id,
            taxonomy: taxonomy.to_string(),
            url: url(&format!("https://example.com/{taxonomy}/{id}/")),
        }
    }

    fn fixture() -> FixtureContent {
        let mut content = FixtureContent::default();
        content.posts.insert(7, post(7));
        content.terms.insert(21, term(21, "category"));
        content.terms.insert(22, term(22, "category"));
        content.taxonomies = vec![TaxonomyInfo {
            name: "category".to_string(),
            public: true,
        }];
        content
            .post_terms
            .insert((7, "category".to_string()), vec![21, 22]);
        content
    }

    fn expander(content: FixtureContent, settings: PurgeSettings) -> Expander {
        Expander::new(Arc::new(content), settings)
    }

    fn urls_of(targets: &TargetSet) -> Vec<&str> {
        targets.iter().map(|t| t.value.as_str()).collect()
    }

    #[tokio::test]
    async fn post_expansion_covers_its_footprint() {
        let mut content = fixture();
        content
            .page_counts
            .insert(ArchiveFilterKey::PostType("post".to_string()), 2);

        let targets = expander(content, PurgeSettings::default())
            .expand_post(7, None)
            .await
            .expect("expansion succeeds");

        let urls = urls_of(&targets);
        assert_eq!(
            urls,
            [
                "https://example.com/posts/7/",
                "https://example.com/",
                "https://example.com/post/",
                "https://example.com/post/page/2/",
                "https://example.com/author/5/",
                "https://example.com/category/21/",
                "https://example.com/category/22/",
            ]
        );
    }

    #[tokio::test]
    async fn expansion_is_deterministic_and_deduplicated() {
        let first = expander(fixture(), PurgeSettings::default())
            .expand_post(7, None)
            .await
            .expect("expansion succeeds");
        let second = expander(fixture(), PurgeSettings::default())
            .expand_post(7, None)
            .await
            .expect("expansion succeeds");

        let mut first: Vec<_> = first.into_vec();
        let mut second: Vec<_> = second.into_vec();
        first.sort_by(|a, b| a.value.cmp(&b.value));
        second.sort_by(|a, b| a.value.cmp(&b.value));
        assert_eq!(first, second);

        let mut values: Vec<_> = first.iter().map(|t| t.value.clone()).collect();
        values.dedup();
        assert_eq!(values.len(), first.len());
    }

    #[tokio::test]
    async fn unknown_post_fails_fast_as_not_found() {
        let err = expander(fixture(), PurgeSettings::default())
            .expand_post(999, None)
            .await
            .expect_err("unknown id");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn differing_original_url_is_included() {
        let original = url("https://example.com/old-permalink/");
        let targets = expander(fixture(), PurgeSettings::default())
            .expand_post(7, Some(&original))
            .await
            .expect("expansion succeeds");
        assert!(targets.contains(&PurgeTarget::url(&original)));

        // Same-as-canonical original adds nothing.
        let canonical = url("https://example.com/posts/7/");
        let targets = expander(fixture(), PurgeSettings::default())
            .expand_post(7, Some(&canonical))
            .await
            .expect("expansion succeeds");
        assert_eq!(
            targets.iter().filter(|t| t.value == canonical.as_str()).count(),
            1
        );
    }

    #[tokio::test]
    async fn non_public_taxonomy_is_skipped() {
        let mut content = fixture();
        content.taxonomies = vec![TaxonomyInfo {
            name: "category".to_string(),
            public: false,
        }];

        let targets = expander(content, PurgeSettings::default())
            .expand_post(7, None)
            .await
            .expect("expansion succeeds");
        assert!(!urls_of(&targets).contains(&"https://example.com/category/21/"));
    }

    #[tokio::test]
    async fn failed_archive_branch_skips_only_that_branch() {
        let mut content = fixture();
        content.fail_post_type_archive = true;

        let targets = expander(content, PurgeSettings::default())
            .expand_post(7, None)
            .await
            .expect("expansion still succeeds");

        let urls = urls_of(&targets);
        assert!(!urls.contains(&"https://example.com/post/"));
        assert!(urls.contains(&"https://example.com/author/5/"));
        assert!(urls.contains(&"https://example.com/category/21/"));
    }

    #[tokio::test]
    async fn zero_page_archive_contributes_nothing() {
        let mut content = fixture();
        content
            .page_counts
            .insert(ArchiveFilterKey::Author(5), 0);

        let targets = expander(content, PurgeSettings::default())
            .expand_post(7, None)
            .await
            .expect("expansion succeeds");
        assert!(!urls_of(&targets).contains(&"https://example.com/author/5/"));
    }

    #[tokio::test]
    async fn date_archives_are_off_by_default() {
        let targets = expander(fixture(), PurgeSettings::default())
            .expand_post(7, None)
            .await
            .expect("expansion succeeds");
        assert!(!urls_of(&targets).contains(&"https://example.com/2024/"));

        let settings = PurgeSettings {
            purge_date_archives: true,
            ..PurgeSettings::default()
        };
        let targets = expander(fixture(), settings)
            .expand_post(7, None)
            .await
            .expect("expansion succeeds");
        let urls = urls_of(&targets);
        assert!(urls.contains(&"https://example.com/2024/03/09/"));
        assert!(urls.contains(&"https://example.com/2024/03/"));
        assert!(urls.contains(&"https://example.com/2024/"));
    }

    #[tokio::test]
    async fn attachments_purge_their_variants() {
        let mut content = fixture();
        let mut attachment = post(8);
        attachment.is_attachment = true;
        content.posts.insert(8, attachment);
        content.attachment_urls = vec![
            url("https://example.com/uploads/image.jpg"),
            url("https://example.com/uploads/image-300x200.jpg"),
        ];

        let targets = expander(content, PurgeSettings::default())
            .expand_post(8, None)
            .await
            .expect("expansion succeeds");
        let urls = urls_of(&targets);
        assert!(urls.contains(&"https://example.com/uploads/image.jpg"));
        assert!(urls.contains(&"https://example.com/uploads/image-300x200.jpg"));
    }

    #[tokio::test]
    async fn term_expansion_paginates_the_term_archive() {
        let mut content = fixture();
        content.page_counts.insert(ArchiveFilterKey::Term(21), 3);

        let targets = expander(content, PurgeSettings::default())
            .expand_term(21)
            .await
            .expect("expansion succeeds");
        assert_eq!(
            urls_of(&targets),
            [
                "https://example.com/category/21/",
                "https://example.com/category/21/page/2/",
                "https://example.com/category/21/page/3/",
                "https://example.com/",
            ]
        );
    }

    #[tokio::test]
    async fn tag_mode_emits_the_fixed_tag_set() {
        let settings = PurgeSettings {
            tag_mode: true,
            ..PurgeSettings::default()
        };
        let targets = expander(fixture(), settings)
            .expand_post(7, None)
            .await
            .expect("expansion succeeds");

        let tags: Vec<_> = targets.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(
            tags,
            ["post-type:post", "author:5", "term:21", "term:22", "date:2024-03", "home"]
        );
    }

    struct FeedContributor;

    #[async_trait]
    impl TargetContributor for FeedContributor {
        async fn contribute(&self, _job: &ObjectJob) -> Vec<PurgeTarget> {
            vec![
                PurgeTarget::url(&url("https://example.com/feed/")),
                // Overlaps the core expansion; the union deduplicates.
                PurgeTarget::url(&url("https://example.com/")),
            ]
        }
    }

    #[tokio::test]
    async fn contributors_union_into_the_result() {
        let targets = expander(fixture(), PurgeSettings::default())
            .with_contributor(Arc::new(FeedContributor))
            .expand_post(7, None)
            .await
            .expect("expansion succeeds");

        let urls = urls_of(&targets);
        assert!(urls.contains(&"https://example.com/feed/"));
        assert_eq!(
            urls.iter().filter(|u| **u == "https://example.com/").count(),
            1
        );
    }

    #[tokio::test]
    async fn author_count_is_scoped_to_author_and_post_type() {
        let content = Arc::new(fixture());
        let expander = Expander::new(
            Arc::clone(&content) as Arc<dyn ContentRepo>,
            PurgeSettings::default(),
        );
        expander.expand_post(7, None).await.expect("expansion succeeds");

        let queries = content.count_queries.lock().expect("fixture lock");
        assert!(queries.contains(&ArchiveFilter::for_author(5, "post")));
        assert!(queries.contains(&ArchiveFilter::for_post_type("post")));
    }

    #[tokio::test]
    async fn purge_all_enumerates_nothing() {
        let targets = expander(fixture(), PurgeSettings::default())
            .expand(&ObjectJob::PurgeAll)
            .await
            .expect("no-op expansion");
        assert!(targets.is_empty());
    }
}
