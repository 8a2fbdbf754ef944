//! Bien'ici JSON search API, crawled department by department.

use std::collections::VecDeque;

use async_trait::async_trait;
use homepedia_core::Source;
use homepedia_storage::HttpFetcher;
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::{
    parse_url, AdapterError, PaginationLimits, PaginationState, RawListing, RawPage,
    RecordContext, SourceAdapter, SourceConfig,
};

const PROPERTY_TYPES: [&str; 5] = ["house", "flat", "loft", "castle", "townhouse"];

/// Search response envelope. Every pagination field may be missing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdsEnvelope {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub from: Option<u64>,
    #[serde(default)]
    pub per_page: Option<u64>,
    #[serde(default)]
    pub real_estate_ads: Vec<JsonValue>,
}

/// Offset of the following page, or `None` when this page was the last one.
///
/// `page` and `from` are what was requested. The page bound is
/// `min(total / perPage, configured_max)`, falling back to `configured_max`
/// when the envelope carries no usable total. An echoed `from` is only
/// trusted when it is ahead of the requested one.
pub fn next_offset(
    envelope: &AdsEnvelope,
    page: u32,
    from: u64,
    requested_size: u32,
    configured_max: u32,
) -> Option<u64> {
    if envelope.real_estate_ads.is_empty() {
        return None;
    }
    let per_page = envelope
        .per_page
        .filter(|p| *p > 0)
        .unwrap_or(u64::from(requested_size.max(1)));
    let max_pages = match envelope.total {
        Some(total) if total > 0 => (total / per_page).min(u64::from(configured_max)),
        _ => u64::from(configured_max),
    };
    let from = envelope.from.map_or(from, |echoed| echoed.max(from));
    let current_page = u64::from(page).max(from / per_page + 1);
    (current_page < max_pages).then_some(from + per_page)
}

#[derive(Debug, Clone)]
struct DepartmentCursor {
    department: String,
    zone_id: String,
    from: u64,
    page: u32,
}

pub struct BieniciAdapter {
    ads_url: Url,
    suggest_url: Url,
    departments: VecDeque<String>,
    cursor: Option<DepartmentCursor>,
    limits: PaginationLimits,
    state: PaginationState,
}

impl BieniciAdapter {
    pub fn from_config(config: &SourceConfig, limits: PaginationLimits) -> Result<Self, AdapterError> {
        let suggest_url = config.suggest_url.as_deref().ok_or_else(|| {
            AdapterError::Message("bienici source needs a suggest_url".to_string())
        })?;
        Ok(Self {
            ads_url: parse_url(&config.base_url)?,
            suggest_url: parse_url(suggest_url)?,
            departments: config.departments_or_all().into(),
            cursor: None,
            limits,
            state: PaginationState::default(),
        })
    }

    fn ads_page_url(&self, cursor: &DepartmentCursor) -> Result<Url, AdapterError> {
        let filters = json!({
            "size": self.limits.page_size,
            "from": cursor.from,
            "showAllModels": false,
            "filterType": "buy",
            "propertyType": PROPERTY_TYPES,
            "page": cursor.page,
            "sortBy": "relevance",
            "sortOrder": "desc",
            "onTheMarket": [true],
            "zoneIdsByTypes": { "zoneIds": [cursor.zone_id] },
        });
        Url::parse_with_params(
            self.ads_url.as_str(),
            &[
                ("filters", filters.to_string()),
                ("extensionType", "extendedIfNoResult".to_string()),
            ],
        )
        .map_err(|e| AdapterError::Message(format!("building ads url: {e}")))
    }

    async fn resolve_zone(&self, http: &HttpFetcher, department: &str) -> Result<String, AdapterError> {
        let url = Url::parse_with_params(self.suggest_url.as_str(), &[("q", department)])
            .map_err(|e| AdapterError::Message(format!("building suggest url: {e}")))?;
        let resp = http.fetch_bytes(Source::Bienici.as_str(), &url).await?;
        let suggestions: Vec<JsonValue> = serde_json::from_slice(&resp.body)
            .map_err(|e| AdapterError::Message(format!("parsing suggest response: {e}")))?;
        let zone = suggestions
            .first()
            .and_then(|s| s.get("zoneIds"))
            .and_then(|ids| ids.get(0))
            .and_then(|id| match id {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Number(n) => Some(n.to_string()),
                _ => None,
            });
        zone.ok_or_else(|| AdapterError::Message(format!("no zone id for department {department}")))
    }

    async fn fetch_envelope(
        &self,
        http: &HttpFetcher,
        cursor: &DepartmentCursor,
    ) -> Result<AdsEnvelope, AdapterError> {
        let url = self.ads_page_url(cursor)?;
        let resp = http.fetch_bytes(Source::Bienici.as_str(), &url).await?;
        serde_json::from_slice(&resp.body)
            .map_err(|e| AdapterError::Message(format!("parsing ads envelope: {e}")))
    }
}

#[async_trait]
impl SourceAdapter for BieniciAdapter {
    fn source(&self) -> Source {
        Source::Bienici
    }

    async fn next_page(&mut self, http: &HttpFetcher) -> Result<Option<RawPage>, AdapterError> {
        loop {
            let cursor = match self.cursor.take() {
                Some(cursor) => cursor,
                None => {
                    let Some(department) = self.departments.pop_front() else {
                        return Ok(None);
                    };
                    match self.resolve_zone(http, &department).await {
                        Ok(zone_id) => {
                            debug!(%department, %zone_id, "bienici zone resolved");
                            self.state.max_pages = Some(self.limits.max_pages);
                            DepartmentCursor {
                                department,
                                zone_id,
                                from: 0,
                                page: 1,
                            }
                        }
                        Err(err) => {
                            warn!(%department, error = %err, "skipping department without zone");
                            self.state.mark_incomplete(&department);
                            continue;
                        }
                    }
                }
            };

            let envelope = match self.fetch_envelope(http, &cursor).await {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!(
                        department = %cursor.department,
                        page = cursor.page,
                        error = %err,
                        "skipping rest of department"
                    );
                    self.state.mark_incomplete(&cursor.department);
                    continue;
                }
            };

            self.state.page = cursor.page;
            let context = RecordContext {
                department: Some(cursor.department.clone()),
                page: cursor.page,
            };

            match next_offset(
                &envelope,
                cursor.page,
                cursor.from,
                self.limits.page_size,
                self.limits.max_pages,
            ) {
                Some(from) => {
                    self.cursor = Some(DepartmentCursor {
                        from,
                        page: cursor.page + 1,
                        ..cursor
                    });
                }
                None => info!(
                    department = %cursor.department,
                    pages = cursor.page,
                    total = ?envelope.total,
                    "bienici department done"
                ),
            }

            return Ok(Some(RawPage {
                context,
                records: envelope
                    .real_estate_ads
                    .into_iter()
                    .map(RawListing::Bienici)
                    .collect(),
            }));
        }
    }

    fn pagination(&self) -> &PaginationState {
        &self.state
    }
}
