//! Content-entity references as seen by the purge layer.
//!
//! These are projections of what the content repository knows about an
//! entity, carrying exactly the fields expansion needs: canonical URL,
//! archive scoping (type, author, date), and taxonomy membership.

use serde::{Deserialize, Serialize};
use time::Date;
use url::Url;

/// Identifier of a content entity (post, term, author) in the repository.
pub type EntityId = i64;

/// The kind of content entity a purge event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Post,
    Term,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Post => "post",
            EntityKind::Term => "term",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved view of a post-like entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostInfo {
    pub id: EntityId,
    /// Canonical permalink.
    pub url: Url,
    /// Registered post type (`post`, `page`, `attachment`, custom types).
    pub post_type: String,
    pub author_id: EntityId,
    /// Publication date driving date-archive membership.
    pub published_on: Date,
    /// Media attachments additionally purge their file and size variants.
    pub is_attachment: bool,
}

/// Resolved view of a taxonomy term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermInfo {
    pub id: EntityId,
    pub taxonomy: String,
    /// Archive URL listing the term's posts.
    pub url: Url,
}

/// A taxonomy registered against a post type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxonomyInfo {
    pub name: String,
    /// Non-public taxonomies have no archives and are skipped entirely.
    pub public: bool,
}

/// A calendar period for date archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatePeriod {
    Year { year: i32 },
    Month { year: i32, month: u8 },
    Day { year: i32, month: u8, day: u8 },
}

impl DatePeriod {
    /// The three periods a publication date belongs to, day first.
    pub fn containing(date: Date) -> [DatePeriod; 3] {
        let year = date.year();
        let month = u8::from(date.month());
        let day = date.day();
        [
            DatePeriod::Day { year, month, day },
            DatePeriod::Month { year, month },
            DatePeriod::Year { year },
        ]
    }
}

/// Scope of an archive page-count query against the content repository.
///
/// Fields compose: an author filter with a post type counts that author's
/// entries of that type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveFilter {
    pub post_type: Option<String>,
    pub author_id: Option<EntityId>,
    pub term_id: Option<EntityId>,
    pub date: Option<DatePeriod>,
}

impl ArchiveFilter {
    pub fn for_post_type(post_type: impl Into<String>) -> Self {
        Self {
            post_type: Some(post_type.into()),
            ..Self::default()
        }
    }

    pub fn for_author(author_id: EntityId, post_type: impl Into<String>) -> Self {
        Self {
            post_type: Some(post_type.into()),
            author_id: Some(author_id),
            ..Self::default()
        }
    }

    pub fn for_term(term_id: EntityId) -> Self {
        Self {
            term_id: Some(term_id),
            ..Self::default()
        }
    }

    pub fn for_date(period: DatePeriod) -> Self {
        Self {
            date: Some(period),
            ..Self::default()
        }
    }
}
