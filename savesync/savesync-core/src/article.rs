//! Article records and the remote path layout they map onto.
//!
//! An [`Article`] is what the ingestion pipeline produces and what the sync
//! core moves between devices. Its serialized form is the *manifest* stored at
//! `saves/<slug>/article.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SAVES_PREFIX: &str = "saves/";
pub const MANIFEST_FILE: &str = "article.json";
pub const INDEX_FILE: &str = "index.html";
pub const RAW_FILE: &str = "raw.html";
pub const FETCH_LOG_FILE: &str = "fetch-log";
pub const THUMBNAIL_STEM: &str = "thumbnail";
pub const MANIFEST_CONTENT_TYPE: &str = "application/json";

const MAX_SLUG_LEN: usize = 200;
const WORDS_PER_MINUTE: usize = 230;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ArticleState {
    Unread,
    Archived,
    Deleted,
}

impl ArticleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleState::Unread => "unread",
            ArticleState::Archived => "archived",
            ArticleState::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unread" => Some(ArticleState::Unread),
            "archived" => Some(ArticleState::Archived),
            "deleted" => Some(ArticleState::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for ArticleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an article entered the system.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum IngestSource {
    Manual,
    Bookmarklet,
    Extension,
    Other(String),
}

impl IngestSource {
    pub fn as_str(&self) -> &str {
        match self {
            IngestSource::Manual => "manual",
            IngestSource::Bookmarklet => "bookmarklet",
            IngestSource::Extension => "extension",
            IngestSource::Other(s) => s,
        }
    }
}

impl From<&str> for IngestSource {
    fn from(s: &str) -> Self {
        match s {
            "manual" => IngestSource::Manual,
            "bookmarklet" => IngestSource::Bookmarklet,
            "extension" => IngestSource::Extension,
            other => IngestSource::Other(other.to_string()),
        }
    }
}

impl Serialize for IngestSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for IngestSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(IngestSource::from(s.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlugError {
    #[error("slug is empty")]
    Empty,
    #[error("slug exceeds 200 bytes")]
    TooLong,
    #[error("slug contains invalid character {0:?}")]
    InvalidChar(char),
    #[error("slug may not be a relative path component")]
    Reserved,
}

/// Check that `slug` is usable as a single remote path segment.
pub fn validate_slug(slug: &str) -> Result<(), SlugError> {
    if slug.is_empty() {
        return Err(SlugError::Empty);
    }
    if slug.len() > MAX_SLUG_LEN {
        return Err(SlugError::TooLong);
    }
    if slug == "." || slug == ".." {
        return Err(SlugError::Reserved);
    }
    if let Some(c) = slug
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')))
    {
        return Err(SlugError::InvalidChar(c));
    }
    Ok(())
}

/// Derive a slug from a title: lowercase ASCII words joined by `-`.
pub fn slugify(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_dash = false;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else if c == '\'' || c == '\u{2019}' {
            // apostrophes vanish rather than split words
        } else {
            pending_dash = true;
        }
        if out.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    if out.is_empty() {
        out.push_str("untitled");
    }
    out.truncate(MAX_SLUG_LEN);
    out.trim_end_matches('-').to_string()
}

/// A saved article. Field names serialize in the manifest's camelCase form.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    slug: String,
    pub title: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    state: ArticleState,
    pub ingest_source: IngestSource,
    pub ingest_date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Article {
    pub fn new(
        slug: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
        ingest_source: IngestSource,
    ) -> Result<Self, SlugError> {
        let slug = slug.into();
        validate_slug(&slug)?;
        let now = Utc::now();
        Ok(Self {
            slug,
            title: title.into(),
            url: url.into(),
            author: None,
            site_name: None,
            state: ArticleState::Unread,
            ingest_source,
            ingest_date: now,
            updated_at: now,
        })
    }

    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn with_site_name(mut self, site_name: impl Into<String>) -> Self {
        self.site_name = Some(site_name.into());
        self
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn state(&self) -> ArticleState {
        self.state
    }

    /// Move to `state`, stamping `updated_at`. Returns false when the article
    /// is already deleted or already in `state`.
    pub fn set_state(&mut self, state: ArticleState) -> bool {
        if self.state == ArticleState::Deleted || self.state == state {
            return false;
        }
        self.state = state;
        self.touch();
        true
    }

    pub fn touch(&mut self) {
        let now = Utc::now();
        // keep updated_at strictly increasing even on coarse clocks
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::milliseconds(1)
        };
    }

    pub fn manifest_path(&self) -> String {
        manifest_path(&self.slug)
    }

    pub fn manifest_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Parse a manifest, rejecting slugs that could escape their prefix.
    pub fn from_manifest(bytes: &[u8]) -> Result<Self, ManifestError> {
        let article: Article = serde_json::from_slice(bytes)?;
        validate_slug(&article.slug)?;
        Ok(article)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("malformed manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error("manifest has invalid slug: {0}")]
    Slug(#[from] SlugError),
}

/// Local-only estimates. Never part of the manifest.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArticleStats {
    pub read_time_minutes: u32,
    pub size_bytes: u64,
}

impl ArticleStats {
    pub fn estimate(content: &str) -> Self {
        let words = content.split_whitespace().count();
        let minutes = words.div_ceil(WORDS_PER_MINUTE).max(1);
        Self {
            read_time_minutes: minutes as u32,
            size_bytes: content.len() as u64,
        }
    }
}

pub fn article_prefix(slug: &str) -> String {
    format!("{SAVES_PREFIX}{slug}/")
}

pub fn manifest_path(slug: &str) -> String {
    format!("{SAVES_PREFIX}{slug}/{MANIFEST_FILE}")
}

pub fn index_path(slug: &str) -> String {
    format!("{SAVES_PREFIX}{slug}/{INDEX_FILE}")
}

pub fn raw_path(slug: &str) -> String {
    format!("{SAVES_PREFIX}{slug}/{RAW_FILE}")
}

pub fn fetch_log_path(slug: &str) -> String {
    format!("{SAVES_PREFIX}{slug}/{FETCH_LOG_FILE}")
}

pub fn thumbnail_path(slug: &str, extension: &str) -> String {
    format!("{SAVES_PREFIX}{slug}/{THUMBNAIL_STEM}.{extension}")
}

/// `saves/<slug>/article.json` -> `<slug>`
pub fn slug_from_manifest_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(SAVES_PREFIX)?;
    let (slug, file) = rest.split_once('/')?;
    if file != MANIFEST_FILE || validate_slug(slug).is_err() {
        return None;
    }
    Some(slug)
}

/// `saves/<slug>/` (a folder entry from a listing) -> `<slug>`
pub fn slug_from_prefix_entry(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(SAVES_PREFIX)?;
    let slug = rest.strip_suffix('/')?;
    if validate_slug(slug).is_err() {
        return None;
    }
    Some(slug)
}
