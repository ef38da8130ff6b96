//! Core data models shared by the parser, store, ingestor, and retriever.
//!
//! Types with a `Parsed` prefix are the pure output of
//! [`crate::parser::parse`]; the unprefixed types (`Document`, `Heading`,
//! ...) are Store rows that carry the identifiers the Store assigns.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single frontmatter value, preserving its declared shape.
///
/// `tags`/`concepts` are normalized to `List` regardless of how the author
/// wrote them (a bare string becomes a one-element list, a comma-separated
/// string is split).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrontmatterValue {
    String(String),
    List(Vec<String>),
    Int(i64),
    Bool(bool),
}

impl FrontmatterValue {
    /// Coerce to a list of strings the way `tags`/`concepts` fields are
    /// normalized: a comma-separated string splits into parts, a list
    /// passes through, anything else becomes a single-element list of its
    /// string form.
    pub fn into_list(self) -> Vec<String> {
        match self {
            FrontmatterValue::List(items) => items
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            FrontmatterValue::String(s) => s
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            FrontmatterValue::Int(n) => vec![n.to_string()],
            FrontmatterValue::Bool(b) => vec![b.to_string()],
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FrontmatterValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

pub type Frontmatter = HashMap<String, FrontmatterValue>;

/// A heading extracted during parsing, before the Store assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedHeading {
    pub ordinal: i64,
    pub level: u8,
    pub text: String,
    pub anchor: String,
}

/// A link occurrence extracted during parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedLink {
    pub target: String,
    pub is_external: bool,
}

/// A chunk extracted during parsing, before the Store assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedChunk {
    pub ordinal: i64,
    pub heading_path: String,
    pub content: String,
    pub token_estimate: i64,
}

/// The full structured output of [`crate::parser::parse`].
///
/// Pure data: no ids, no database interaction. The Ingestor is responsible
/// for turning this into Store rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub frontmatter: Frontmatter,
    pub headings: Vec<ParsedHeading>,
    pub links: Vec<ParsedLink>,
    pub chunks: Vec<ParsedChunk>,
    pub title: String,
    pub summary: String,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub concepts: Vec<String>,
    pub token_estimate: i64,
    pub content_hash: String,
}

/// A document row as persisted by the Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub path: String,
    pub title: String,
    pub summary: String,
    pub category: Option<String>,
    pub token_estimate: i64,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A heading row as persisted by the Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heading {
    pub document_id: i64,
    pub ordinal: i64,
    pub level: u8,
    pub text: String,
    pub anchor: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Unknown,
    Ok,
    Broken,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Unknown => "unknown",
            LinkStatus::Ok => "ok",
            LinkStatus::Broken => "broken",
        }
    }
}

/// A link row as persisted by the Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub document_id: i64,
    pub target: String,
    pub is_external: bool,
    pub status: LinkStatus,
    pub checked_at: Option<DateTime<Utc>>,
}

/// A chunk row as persisted by the Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub document_id: i64,
    pub ordinal: i64,
    pub heading_path: String,
    pub content: String,
    pub token_estimate: i64,
}

/// Which kind of row an [`Embedding`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingOwner {
    Document,
    Chunk,
}

/// An embedding row as persisted by the Store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub owner: EmbeddingOwner,
    pub owner_id: i64,
    pub vector: Vec<f32>,
    pub dimension: usize,
    pub backend: String,
    pub generated_at: DateTime<Utc>,
}

/// A cached query result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryCacheEntry {
    pub query_hash: String,
    pub result_document_ids: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Modify,
    Move,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Modify => "modify",
            EventKind::Move => "move",
            EventKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Queued,
    InFlight,
    Done,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Queued => "queued",
            EventStatus::InFlight => "in_flight",
            EventStatus::Done => "done",
            EventStatus::Failed => "failed",
        }
    }
}

/// A pending file-system event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub path: String,
    pub kind: EventKind,
    pub new_path: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub attempt_count: i32,
    pub status: EventStatus,
    pub last_error: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frontmatter_list_from_comma_string() {
        let v = FrontmatterValue::String("rust, cli , search".to_string());
        assert_eq!(v.into_list(), vec!["rust", "cli", "search"]);
    }

    #[test]
    fn frontmatter_list_passthrough() {
        let v = FrontmatterValue::List(vec!["a".to_string(), " b ".to_string()]);
        assert_eq!(v.into_list(), vec!["a", "b"]);
    }

    #[test]
    fn frontmatter_list_from_scalar() {
        assert_eq!(FrontmatterValue::Int(3).into_list(), vec!["3"]);
        assert_eq!(FrontmatterValue::Bool(true).into_list(), vec!["true"]);
    }
}
