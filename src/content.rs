//! The content-repository boundary.
//!
//! Expansion never touches content storage directly; everything it needs
//! from the host CMS — entity lookup, archive link resolution, pagination
//! counts, taxonomy membership — comes through [`ContentRepo`]. The host
//! application implements this against its own query layer.

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::domain::{ArchiveFilter, DatePeriod, EntityId, PostInfo, TaxonomyInfo, TermInfo};

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("content repository error: {0}")]
    Repository(String),
}

impl ContentError {
    pub fn repository(err: impl std::fmt::Display) -> Self {
        Self::Repository(err.to_string())
    }
}

/// Read-only queries against the host content repository.
///
/// Lookup methods return `Ok(None)` when the entity or link genuinely does
/// not exist (deleted entity, unregistered archive); `Err` is reserved for
/// the repository itself failing and is treated as retryable upstream.
#[async_trait]
pub trait ContentRepo: Send + Sync {
    /// Resolve a post-like entity by id.
    async fn post(&self, id: EntityId) -> Result<Option<PostInfo>, ContentError>;

    /// Resolve a taxonomy term by id.
    async fn term(&self, id: EntityId) -> Result<Option<TermInfo>, ContentError>;

    /// The site front page.
    async fn home_url(&self) -> Result<Url, ContentError>;

    /// Archive/listing URL for a post type, if the type has one.
    async fn post_type_archive_url(&self, post_type: &str)
    -> Result<Option<Url>, ContentError>;

    /// Archive URL for an author.
    async fn author_archive_url(&self, author_id: EntityId)
    -> Result<Option<Url>, ContentError>;

    /// Archive URL for a calendar period, if date archives are routed.
    async fn date_archive_url(&self, period: &DatePeriod) -> Result<Option<Url>, ContentError>;

    /// Taxonomies registered against a post type.
    async fn taxonomies_for(&self, post_type: &str) -> Result<Vec<TaxonomyInfo>, ContentError>;

    /// Terms of `taxonomy` assigned to a post.
    async fn terms_for_post(
        &self,
        post_id: EntityId,
        taxonomy: &str,
    ) -> Result<Vec<TermInfo>, ContentError>;

    /// Number of archive pages the filter's entries span under the site's
    /// per-page setting. Zero means the archive has no cacheable pages.
    async fn archive_page_count(&self, filter: &ArchiveFilter) -> Result<u32, ContentError>;

    /// Direct file URL and registered image-size variant URLs for a media
    /// attachment.
    async fn attachment_urls(&self, attachment_id: EntityId) -> Result<Vec<Url>, ContentError>;
}

/// URL of page `page` of a paginated archive.
///
/// Page one is the archive itself; later pages append the `page/<n>/`
/// suffix the host's rewrite rules expose.
pub fn archive_page_url(base: &Url, page: u32) -> Url {
    if page <= 1 {
        return base.clone();
    }
    let mut url = base.clone();
    {
        let mut path = url.path().trim_end_matches('/').to_string();
        path.push_str(&format!("/page/{page}/"));
        url.set_path(&path);
    }
    url
}
