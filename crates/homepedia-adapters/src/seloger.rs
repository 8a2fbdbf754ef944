//! SeLoger search result pages.

use std::collections::VecDeque;

use async_trait::async_trait;
use homepedia_core::Source;
use homepedia_storage::HttpFetcher;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{
    parse_url, text_or_none, AdapterError, PaginationLimits, PaginationState, RawListing,
    RawPage, RecordContext, SourceAdapter, SourceConfig,
};

const CARD: &str = r#"div[data-testid="serp-core-classified-card-testid"]"#;
const PRICE: &str = r#"div[data-testid="cardmfe-price-testid"]"#;
const KEY_FACTS: &str = r#"div[data-testid="cardmfe-keyfacts-testid"] div"#;
const ADDRESS: &str = r#"div[data-testid="cardmfe-description-box-address"]"#;
const DESCRIPTION: &str = r#"div[data-testid="cardmfe-description-text-test-id"] div"#;
const TYPE_TEXT: &str = r#"div[data-testid="cardmfe-description-box-text-test-id"] div"#;
const LINK: &str = r#"a[data-testid="card-mfe-covering-link-testid"]"#;
const META_DESCRIPTION: &str = r#"meta[name="description"]"#;

/// Text pulled out of one listing card, before any normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelogerCard {
    pub price_text: Option<String>,
    pub key_facts: Vec<String>,
    pub address: Option<String>,
    pub description: Option<String>,
    pub type_text: Option<String>,
    /// Absolute listing URL.
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedSerp {
    pub total_listings: Option<u64>,
    pub cards: Vec<SelogerCard>,
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(e.to_string()))
}

fn select_first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn select_all_texts(scope: ElementRef<'_>, sel: &Selector) -> Vec<String> {
    scope
        .select(sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect()
}

fn select_first_attr(scope: ElementRef<'_>, sel: &Selector, attr: &str) -> Option<String> {
    scope
        .select(sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

/// Parses one search result page. Relative card links resolve against `page_url`.
pub fn parse_listing_page(html: &str, page_url: &Url) -> Result<ParsedSerp, AdapterError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let total_listings = select_first_attr(root, &selector(META_DESCRIPTION)?, "content")
        .and_then(|content| {
            let first_word = content.split_whitespace().next()?.to_string();
            let digits: String = first_word.chars().filter(char::is_ascii_digit).collect();
            digits.parse().ok()
        });

    let card_sel = selector(CARD)?;
    let price_sel = selector(PRICE)?;
    let facts_sel = selector(KEY_FACTS)?;
    let address_sel = selector(ADDRESS)?;
    let description_sel = selector(DESCRIPTION)?;
    let type_sel = selector(TYPE_TEXT)?;
    let link_sel = selector(LINK)?;

    let cards = document
        .select(&card_sel)
        .map(|card| SelogerCard {
            price_text: select_first_text(card, &price_sel),
            key_facts: select_all_texts(card, &facts_sel)
                .into_iter()
                .filter(|fact| fact != "·")
                .collect(),
            address: select_first_text(card, &address_sel),
            description: select_first_text(card, &description_sel),
            type_text: select_first_text(card, &type_sel),
            link: select_first_attr(card, &link_sel, "href")
                .and_then(|href| page_url.join(&href).ok())
                .map(|url| url.to_string()),
        })
        .collect();

    Ok(ParsedSerp {
        total_listings,
        cards,
    })
}

/// `min(count / page_size + 1, configured_max)`, or the configured max without a count.
pub fn page_bound(total_listings: Option<u64>, page_size: u32, configured_max: u32) -> u32 {
    match total_listings {
        Some(count) => {
            let pages = count / u64::from(page_size.max(1)) + 1;
            pages.min(u64::from(configured_max)) as u32
        }
        None => configured_max,
    }
}

#[derive(Debug, Clone)]
struct DepartmentCursor {
    department: String,
    page: u32,
    max_pages: u32,
}

pub struct SelogerAdapter {
    base_url: String,
    departments: VecDeque<String>,
    cursor: Option<DepartmentCursor>,
    limits: PaginationLimits,
    state: PaginationState,
}

impl SelogerAdapter {
    pub fn from_config(config: &SourceConfig, limits: PaginationLimits) -> Result<Self, AdapterError> {
        let base_url = parse_url(&config.base_url)?
            .to_string()
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            base_url,
            departments: config.departments_or_all().into(),
            cursor: None,
            limits,
            state: PaginationState::default(),
        })
    }

    fn page_url(&self, department: &str, page: u32) -> Result<Url, AdapterError> {
        parse_url(&format!(
            "{}/{department}/?LISTING-LISTpg={page}",
            self.base_url
        ))
    }
}

#[async_trait]
impl SourceAdapter for SelogerAdapter {
    fn source(&self) -> Source {
        Source::Seloger
    }

    async fn next_page(&mut self, http: &HttpFetcher) -> Result<Option<RawPage>, AdapterError> {
        loop {
            let cursor = match self.cursor.take() {
                Some(cursor) => cursor,
                None => {
                    let Some(department) = self.departments.pop_front() else {
                        return Ok(None);
                    };
                    DepartmentCursor {
                        department,
                        page: 1,
                        max_pages: self.limits.max_pages,
                    }
                }
            };

            let url = self.page_url(&cursor.department, cursor.page)?;
            let parsed = match http.fetch_bytes(Source::Seloger.as_str(), &url).await {
                Ok(resp) => parse_listing_page(&String::from_utf8_lossy(&resp.body), &url)?,
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

            let max_pages = if cursor.page == 1 {
                page_bound(parsed.total_listings, self.limits.page_size, self.limits.max_pages)
            } else {
                cursor.max_pages
            };
            self.state.page = cursor.page;
            self.state.max_pages = Some(max_pages);

            let context = RecordContext {
                department: Some(cursor.department.clone()),
                page: cursor.page,
            };
            if cursor.page < max_pages && !parsed.cards.is_empty() {
                self.cursor = Some(DepartmentCursor {
                    page: cursor.page + 1,
                    max_pages,
                    ..cursor
                });
            } else {
                info!(department = %cursor.department, pages = cursor.page, "seloger department done");
            }

            return Ok(Some(RawPage {
                context,
                records: parsed.cards.into_iter().map(RawListing::Seloger).collect(),
            }));
        }
    }

    fn pagination(&self) -> &PaginationState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sample_html() -> String {
        let path = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/seloger/sample/listing.html");
        std::fs::read_to_string(path).expect("fixture")
    }

    fn page_url() -> Url {
        Url::parse("https://www.seloger.com/immobilier/achat/34/?LISTING-LISTpg=1").expect("url")
    }

    #[test]
    fn sample_page_yields_cards_and_count() {
        let parsed = parse_listing_page(&sample_html(), &page_url()).expect("parse");
        assert_eq!(parsed.total_listings, Some(40));
        assert_eq!(parsed.cards.len(), 3);

        let house = &parsed.cards[0];
        assert_eq!(
            house.link.as_deref(),
            Some("https://www.seloger.com/annonces/achat/maison/montpellier-34/219876543.htm")
        );
        assert_eq!(
            house.key_facts,
            vec!["5 pièces", "3 chambres", "118,5 m²", "terrain 600 m²"]
        );
        assert_eq!(house.address.as_deref(), Some("Montpellier (34000)"));
        assert_eq!(house.type_text.as_deref(), Some("Maison à vendre"));
        assert_eq!(
            house.description.as_deref(),
            Some("Belle maison familiale avec piscine.")
        );

        assert!(parsed.cards[2].link.is_none());
    }

    #[test]
    fn page_bound_uses_listing_count() {
        assert_eq!(page_bound(Some(40), 25, 100), 2);
        assert_eq!(page_bound(Some(10_000), 25, 100), 100);
        assert_eq!(page_bound(None, 25, 7), 7);
    }

    #[test]
    fn page_without_cards_parses_empty() {
        let parsed = parse_listing_page("<html><body></body></html>", &page_url()).expect("parse");
        assert_eq!(parsed, ParsedSerp::default());
    }
}
