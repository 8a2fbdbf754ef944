//! Source adapter contracts + the DVF, Bien'ici and SeLoger adapters.

pub mod bienici;
pub mod dvf;
pub mod mapper;
pub mod seloger;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homepedia_core::{Property, Source};
use homepedia_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use bienici::BieniciAdapter;
pub use dvf::{DvfAdapter, DvfRow};
pub use seloger::{SelogerAdapter, SelogerCard};

pub const CRATE_NAME: &str = "homepedia-adapters";

/// One entry of `sources.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source: Source,
    pub display_name: String,
    pub enabled: bool,
    pub base_url: String,
    #[serde(default)]
    pub suggest_url: Option<String>,
    #[serde(default)]
    pub years: Vec<u16>,
    /// Restricts the crawl to these departments. Empty means all of them.
    #[serde(default)]
    pub departments: Vec<String>,
    /// Pre-downloaded DVF dumps read instead of `years`.
    #[serde(default)]
    pub local_files: Vec<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceConfig {
    pub fn departments_or_all(&self) -> Vec<String> {
        if self.departments.is_empty() {
            all_departments()
        } else {
            self.departments
                .iter()
                .map(|d| d.trim().to_ascii_lowercase())
                .collect()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaginationLimits {
    pub max_pages: u32,
    pub page_size: u32,
    /// Rows per page for bulk file sources.
    pub chunk_size: usize,
}

impl Default for PaginationLimits {
    fn default() -> Self {
        Self {
            max_pages: 100,
            page_size: 25,
            chunk_size: 1000,
        }
    }
}

/// Metropolitan departments `01`..`95` plus the two Corsican codes.
pub fn all_departments() -> Vec<String> {
    (1..=95)
        .map(|n| format!("{n:02}"))
        .chain(["2a".to_string(), "2b".to_string()])
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordContext {
    pub department: Option<String>,
    pub page: u32,
}

/// A record exactly as the source produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum RawListing {
    Dvf(DvfRow),
    Bienici(JsonValue),
    Seloger(SelogerCard),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawPage {
    pub context: RecordContext,
    pub records: Vec<RawListing>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaginationState {
    /// Last page handed out for the current department or dump.
    pub page: u32,
    pub max_pages: Option<u32>,
    /// Departments (or DVF dumps) whose pages could not all be fetched.
    pub incomplete_departments: Vec<String>,
}

impl PaginationState {
    fn mark_incomplete(&mut self, segment: &str) {
        if !self.incomplete_departments.iter().any(|s| s == segment) {
            self.incomplete_departments.push(segment.to_string());
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Why a single raw record could not become a [`Property`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MapRejection {
    #[error("pre-construction programme listing")]
    PreConstruction,
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("malformed field {field}: {reason}")]
    Malformed { field: &'static str, reason: String },
    #[error("{0} must be positive")]
    NonPositive(&'static str),
}

#[async_trait]
pub trait SourceAdapter: Send {
    fn source(&self) -> Source;

    /// Next page of raw records, or `None` once the source is exhausted.
    async fn next_page(&mut self, http: &HttpFetcher) -> Result<Option<RawPage>, AdapterError>;

    fn pagination(&self) -> &PaginationState;

    fn map_record(
        &self,
        listing: RawListing,
        ctx: &RecordContext,
        seen_at: DateTime<Utc>,
    ) -> Result<Property, MapRejection> {
        mapper::map_listing(listing, ctx, seen_at)
    }
}

pub fn adapter_for_source(
    config: &SourceConfig,
    limits: PaginationLimits,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    Ok(match config.source {
        Source::Dvf => Box::new(DvfAdapter::from_config(config, limits)?),
        Source::Bienici => Box::new(BieniciAdapter::from_config(config, limits)?),
        Source::Seloger => Box::new(SelogerAdapter::from_config(config, limits)?),
    })
}

fn parse_url(raw: &str) -> Result<reqwest::Url, AdapterError> {
    reqwest::Url::parse(raw).map_err(|e| AdapterError::Message(format!("invalid url {raw:?}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn department_list_covers_mainland_and_corsica() {
        let departments = all_departments();
        assert_eq!(departments.len(), 97);
        assert_eq!(departments[0], "01");
        assert!(departments.contains(&"75".to_string()));
        assert_eq!(departments.last().map(String::as_str), Some("2b"));
    }

    #[test]
    fn configured_departments_narrow_the_crawl() {
        let config = seloger_config();
        assert_eq!(config.departments_or_all(), vec!["75", "2a"]);
    }

    fn seloger_config() -> SourceConfig {
        serde_json::from_value(serde_json::json!({
            "source": "seloger",
            "display_name": "SeLoger",
            "enabled": true,
            "base_url": "https://www.seloger.com/immobilier/achat",
            "departments": ["75", " 2A "]
        }))
        .expect("config")
    }

    #[test]
    fn repeated_incomplete_marks_are_recorded_once() {
        let mut state = PaginationState::default();
        state.mark_incomplete("13");
        state.mark_incomplete("13");
        assert_eq!(state.incomplete_departments, vec!["13"]);
    }
}
