//! Token records and row selection criteria.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::StoreError;

/// Opaque identifier of a stored command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(Uuid);

impl TokenId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TokenId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Who submitted a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Submitted by an end user, tagged with their origin
    User,
    /// Produced by the ingestion process
    Crawler,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::User => "user",
            Source::Crawler => "crawler",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Source::User),
            "crawler" => Ok(Source::Crawler),
            other => Err(StoreError::Backend(format!("unknown command source '{}'", other))),
        }
    }
}

/// A stored command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub content: String,
    pub source: Source,
    /// Origin of the submitting client; only set for [`Source::User`].
    /// Used for fairness only and never serialized to other clients.
    #[serde(default, skip_serializing)]
    pub origin_tag: Option<String>,
    /// How many times the command has been handed out
    pub view_count: u32,
    pub created_at: DateTime<Utc>,
}

impl Token {
    /// Whether the command can still be handed out.
    pub fn is_available(&self, max_views: u32) -> bool {
        self.view_count < max_views
    }
}

/// A command about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewToken {
    pub content: String,
    pub source: Source,
    pub origin_tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewToken {
    /// A user submission from `origin`.
    pub fn user(content: impl Into<String>, origin: Option<String>) -> Self {
        Self {
            content: content.into(),
            source: Source::User,
            origin_tag: origin.filter(|o| !o.is_empty()),
            created_at: Utc::now(),
        }
    }

    /// An ingested command; never carries an origin.
    pub fn crawler(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: Source::Crawler,
            origin_tag: None,
            created_at: Utc::now(),
        }
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// How a selection treats the origin tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginFilter {
    /// Every origin matches
    Any,
    /// Untagged rows and rows from any other origin match
    Excluding(String),
    /// Only rows tagged with this origin match
    Only(String),
}

/// Criteria for the row a distribution transaction locks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub source: Source,
    pub origin: OriginFilter,
    /// Rows with this many views or more are exhausted
    pub max_views: u32,
}

impl Selection {
    /// Available user submissions the requester did not make themselves.
    pub fn user_excluding(origin: Option<&str>, max_views: u32) -> Self {
        let origin = match origin {
            Some(o) if !o.is_empty() => OriginFilter::Excluding(o.to_string()),
            _ => OriginFilter::Any,
        };
        Self {
            source: Source::User,
            origin,
            max_views,
        }
    }

    /// Available user submissions made by `origin`.
    pub fn user_from(origin: &str, max_views: u32) -> Self {
        Self {
            source: Source::User,
            origin: OriginFilter::Only(origin.to_string()),
            max_views,
        }
    }

    /// Available ingested commands.
    pub fn crawler(max_views: u32) -> Self {
        Self {
            source: Source::Crawler,
            origin: OriginFilter::Any,
            max_views,
        }
    }

    /// Whether `token` satisfies this selection.
    pub fn matches(&self, token: &Token) -> bool {
        if !token.is_available(self.max_views) || token.source != self.source {
            return false;
        }

        let tag = token.origin_tag.as_deref().filter(|t| !t.is_empty());
        match &self.origin {
            OriginFilter::Any => true,
            OriginFilter::Excluding(origin) => tag != Some(origin.as_str()),
            OriginFilter::Only(origin) => tag == Some(origin.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(source: Source, origin: Option<&str>, views: u32) -> Token {
        Token {
            id: TokenId::new(),
            content: "shared command text".to_string(),
            source,
            origin_tag: origin.map(str::to_string),
            view_count: views,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_excluding_selection() {
        let selection = Selection::user_excluding(Some("A"), 3);

        assert!(!selection.matches(&token(Source::User, Some("A"), 0)));
        assert!(selection.matches(&token(Source::User, Some("B"), 0)));
        assert!(selection.matches(&token(Source::User, None, 0)));
        assert!(selection.matches(&token(Source::User, Some(""), 0)));
        assert!(!selection.matches(&token(Source::Crawler, None, 0)));
        assert!(!selection.matches(&token(Source::User, Some("B"), 3)));
    }

    #[test]
    fn test_selection_without_origin_matches_all_users() {
        let selection = Selection::user_excluding(None, 3);
        assert_eq!(selection.origin, OriginFilter::Any);
        assert!(selection.matches(&token(Source::User, Some("A"), 2)));

        let selection = Selection::user_excluding(Some(""), 3);
        assert_eq!(selection.origin, OriginFilter::Any);
    }

    #[test]
    fn test_only_selection() {
        let selection = Selection::user_from("A", 3);
        assert!(selection.matches(&token(Source::User, Some("A"), 0)));
        assert!(!selection.matches(&token(Source::User, Some("B"), 0)));
        assert!(!selection.matches(&token(Source::User, None, 0)));
    }

    #[test]
    fn test_crawler_tokens_drop_origin() {
        let new = NewToken::crawler("shared command text");
        assert_eq!(new.origin_tag, None);

        let new = NewToken::user("shared command text", Some(String::new()));
        assert_eq!(new.origin_tag, None);
    }

    #[test]
    fn test_source_round_trips_through_str() {
        assert_eq!("user".parse::<Source>().unwrap(), Source::User);
        assert_eq!(Source::Crawler.as_str().parse::<Source>().unwrap(), Source::Crawler);
        assert!("robot".parse::<Source>().is_err());
    }
}
