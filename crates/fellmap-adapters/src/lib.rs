//! Race source contracts and the fell-runner listing/detail adapter.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use async_trait::async_trait;
use fellmap_core::ScrapedRace;
use fellmap_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fellmap-adapters";

/// Rows at the top of every listing table that hold headings, not races.
pub const LISTING_HEADER_ROWS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DetailTarget {
    pub url: String,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid selector {0}")]
    InvalidSelector(String),
    #[error("listing {url} row {row} has no column {column}")]
    MissingColumn {
        url: String,
        row: usize,
        column: usize,
    },
    #[error("listing {url} row {row} has no race link")]
    MissingLink { url: String, row: usize },
    #[error("race page {url} has label {label:?} with no value")]
    MissingFieldValue { url: String, label: String },
    #[error("race page {url} has no heading")]
    MissingTitle { url: String },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

#[async_trait]
pub trait RaceSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Every listing page to read, in order. The set is fixed by configuration.
    fn listing_targets(&self) -> Vec<ListingTarget>;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &ListingTarget,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<DetailTarget>, AdapterError>;

    async fn fetch_detail(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &DetailTarget,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_detail(&self, page: &FetchedPage) -> Result<ScrapedRace, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingConfig {
    pub base_url: String,
    pub index_url: String,
    pub upcoming_url: String,
    pub upcoming_pages: RangeInclusive<u32>,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://races.fellrunner.org.uk".to_string(),
            index_url: "https://races.fellrunner.org.uk/races".to_string(),
            upcoming_url: "https://races.fellrunner.org.uk/races/upcoming".to_string(),
            upcoming_pages: 2..=7,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FellrunnerAdapter {
    config: ListingConfig,
}

impl FellrunnerAdapter {
    pub fn new(config: ListingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ListingConfig {
        &self.config
    }
}

pub fn fellrunner_adapter() -> FellrunnerAdapter {
    FellrunnerAdapter::new(ListingConfig::default())
}

async fn fetch_page(
    http: &HttpFetcher,
    ctx: &AdapterContext,
    url: &str,
) -> Result<FetchedPage, AdapterError> {
    let resp = http.fetch_bytes(ctx.run_id, url).await?;
    Ok(FetchedPage {
        url: url.to_string(),
        final_url: resp.final_url.clone(),
        body: resp.text(),
    })
}

#[async_trait]
impl RaceSource for FellrunnerAdapter {
    fn source_id(&self) -> &'static str {
        "fellrunner"
    }

    fn listing_targets(&self) -> Vec<ListingTarget> {
        let mut targets = vec![ListingTarget {
            url: self.config.index_url.clone(),
        }];
        targets.extend(self.config.upcoming_pages.clone().map(|page| ListingTarget {
            url: format!("{}?page={page}", self.config.upcoming_url),
        }));
        targets
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &ListingTarget,
    ) -> Result<FetchedPage, AdapterError> {
        fetch_page(http, ctx, &target.url).await
    }

    fn parse_listing(&self, page: &FetchedPage) -> Result<Vec<DetailTarget>, AdapterError> {
        Ok(parse_listing_html(&page.body, &self.config.base_url, &page.final_url)?)
    }

    async fn fetch_detail(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        target: &DetailTarget,
    ) -> Result<FetchedPage, AdapterError> {
        fetch_page(http, ctx, &target.url).await
    }

    fn parse_detail(&self, page: &FetchedPage) -> Result<ScrapedRace, AdapterError> {
        Ok(parse_detail_html(&page.body, &page.url)?)
    }
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::InvalidSelector(format!("{css}: {e}")))
}

/// Whitespace-trimmed, non-empty text nodes under `element`, in document order.
fn stripped_strings(element: ElementRef<'_>) -> Vec<&str> {
    element
        .text()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn join_url(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        href.trim_start_matches('/')
    )
}

/// Race links from one listing page: skip the header rows, then take the link
/// in the second cell of every remaining row.
pub fn parse_listing_html(
    html: &str,
    base_url: &str,
    page_url: &str,
) -> Result<Vec<DetailTarget>, ParseError> {
    let document = Html::parse_document(html);
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;
    let link_sel = selector("a[href]")?;

    let mut targets = Vec::new();
    for (row_idx, row) in document.select(&row_sel).enumerate().skip(LISTING_HEADER_ROWS) {
        let cell = row
            .select(&cell_sel)
            .nth(1)
            .ok_or_else(|| ParseError::MissingColumn {
                url: page_url.to_string(),
                row: row_idx,
                column: 1,
            })?;
        let href = cell
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
            .ok_or_else(|| ParseError::MissingLink {
                url: page_url.to_string(),
                row: row_idx,
            })?;
        targets.push(DetailTarget {
            url: join_url(base_url, href.trim()),
        });
    }
    Ok(targets)
}

/// `"Date & time:"` -> `"date_&_time"`.
pub fn normalize_field_name(label: &str) -> String {
    let label = label.strip_suffix(':').unwrap_or(label);
    label.to_lowercase().replace(' ', "_")
}

/// Labelled values from a race page. A list item whose first text fragment
/// ends in `:` is a label and its second fragment is the value; other list
/// items are ignored. A label with no value fails the page.
pub fn parse_detail_html(html: &str, race_url: &str) -> Result<ScrapedRace, ParseError> {
    let document = Html::parse_document(html);
    let item_sel = selector("li")?;
    let heading_sel = selector("h1")?;

    let mut fields = BTreeMap::new();
    for item in document.select(&item_sel) {
        let fragments = stripped_strings(item);
        let Some(label) = fragments.first().filter(|s| s.ends_with(':')) else {
            continue;
        };
        let value = fragments.get(1).ok_or_else(|| ParseError::MissingFieldValue {
            url: race_url.to_string(),
            label: label.to_string(),
        })?;
        fields.insert(normalize_field_name(label), value.to_string());
    }

    let title = document
        .select(&heading_sel)
        .next()
        .map(|h| stripped_strings(h).join(" "))
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ParseError::MissingTitle {
            url: race_url.to_string(),
        })?;

    Ok(ScrapedRace {
        race_url: race_url.to_string(),
        title,
        fields,
    })
}
