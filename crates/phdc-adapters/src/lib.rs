//! Source extractor contract, shared paging loop, and per-source implementations.

use std::collections::HashSet;

use async_trait::async_trait;
use phdc_core::{Candidate, Region};
use phdc_storage::PageFetcher;
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

mod euraxess;
mod findaphd;
mod scholarshipdb;

pub use euraxess::EuraxessExtractor;
pub use findaphd::FindAPhdExtractor;
pub use scholarshipdb::ScholarshipDbExtractor;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error("invalid base url `{url}`: {source}")]
    BaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("cannot resolve link `{href}`: {source}")]
    Link {
        href: String,
        #[source]
        source: url::ParseError,
    },
}

/// How a target URL is turned into the URL of its N-th result page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "style", rename_all = "snake_case")]
pub enum PagingScheme {
    /// The target URL carries a `{page}` placeholder, numbered from `first_page`.
    Template { first_page: u32 },
    /// The first page is the bare target URL; later pages append `param=N` (N from 2).
    QueryParam { param: String },
}

impl PagingScheme {
    /// URL of the zero-based `page_index`-th page of `target`.
    pub fn page_url(&self, target: &str, page_index: u32) -> String {
        match self {
            PagingScheme::Template { first_page } => {
                target.replace("{page}", &(first_page + page_index).to_string())
            }
            PagingScheme::QueryParam { param } => {
                if page_index == 0 {
                    return target.to_string();
                }
                let sep = if target.contains('?') { '&' } else { '?' };
                format!("{target}{sep}{param}={}", page_index + 1)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingTarget {
    pub region: Region,
    pub url: String,
}

/// Everything an extractor needs to know about where its listings live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapePlan {
    pub base_url: String,
    pub targets: Vec<ListingTarget>,
    pub paging: PagingScheme,
    pub max_pages: u32,
}

/// One parsed result page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingPage {
    /// Listing elements found on the page, parseable or not. Zero ends pagination.
    pub elements: usize,
    pub candidates: Vec<Candidate>,
}

#[async_trait]
pub trait SourceExtractor: Send + Sync {
    fn source_id(&self) -> &'static str;

    fn plan(&self) -> &ScrapePlan;

    /// Parse one result page into candidates; `region` is the target the page belongs to.
    fn parse_listing(&self, html: &str, region: Region) -> Result<ListingPage, AdapterError>;

    /// Whether the same listing can surface under several targets and must be counted once.
    fn dedupe_urls(&self) -> bool {
        false
    }

    /// Walk every target page by page until a page is empty, unavailable, or `max_pages`
    /// is reached.
    async fn scrape(&self, http: &dyn PageFetcher) -> Result<Vec<Candidate>, AdapterError> {
        let source = self.source_id();
        let plan = self.plan();
        let mut seen: HashSet<String> = HashSet::new();
        let mut candidates = Vec::new();

        for target in &plan.targets {
            let mut found = 0usize;
            for page_index in 0..plan.max_pages {
                let page_no = page_index + 1;
                let url = plan.paging.page_url(&target.url, page_index);
                let page = match http.fetch_page(&url).await {
                    Ok(page) => page,
                    Err(err) => {
                        warn!(source, %url, error = %err, "page unavailable, stopping pagination");
                        break;
                    }
                };

                let listing = self.parse_listing(&page.body, target.region)?;
                if listing.elements == 0 {
                    warn!(source, region = %target.region, page = page_no, "no listings found, stopping pagination");
                    break;
                }
                info!(
                    source,
                    region = %target.region,
                    page = page_no,
                    status = page.status,
                    final_url = %page.url,
                    elements = listing.elements,
                    "parsed listing page"
                );

                for candidate in listing.candidates {
                    if self.dedupe_urls() && !seen.insert(candidate.url.clone()) {
                        continue;
                    }
                    found += 1;
                    candidates.push(candidate);
                }
            }
            info!(source, region = %target.region, target = %target.url, found, "target complete");
        }

        info!(source, total = candidates.len(), "scrape complete");
        Ok(candidates)
    }
}

/// Build the extractor registered under `source_id`, or `None` for an unknown source.
pub fn extractor_for_source(
    source_id: &str,
    plan: ScrapePlan,
) -> Result<Option<Box<dyn SourceExtractor>>, AdapterError> {
    let extractor: Box<dyn SourceExtractor> = match source_id {
        euraxess::SOURCE_ID => Box::new(EuraxessExtractor::new(plan)?),
        scholarshipdb::SOURCE_ID => Box::new(ScholarshipDbExtractor::new(plan)?),
        findaphd::SOURCE_ID => Box::new(FindAPhdExtractor::new(plan)?),
        _ => return Ok(None),
    };
    Ok(Some(extractor))
}

pub(crate) fn compile_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

/// Compile an ordered fallback chain.
pub(crate) fn compile_chain(chain: &[&str]) -> Result<Vec<Selector>, AdapterError> {
    chain.iter().map(|s| compile_selector(s)).collect()
}

pub(crate) fn parse_base_url(base_url: &str) -> Result<Url, AdapterError> {
    Url::parse(base_url).map_err(|source| AdapterError::BaseUrl {
        url: base_url.to_string(),
        source,
    })
}

/// First element matched by the earliest selector in `chain` that matches anything.
pub(crate) fn first_in<'a>(scope: ElementRef<'a>, chain: &[Selector]) -> Option<ElementRef<'a>> {
    chain.iter().find_map(|sel| scope.select(sel).next())
}

/// Visible text with runs of whitespace collapsed to single spaces.
pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text of the first fallback match, or empty when the field is absent.
pub(crate) fn chain_text(scope: ElementRef<'_>, chain: &[Selector]) -> String {
    first_in(scope, chain).map(element_text).unwrap_or_default()
}

/// Title text and absolute link of the listing's title anchor. Both are mandatory.
pub(crate) fn title_link(
    scope: ElementRef<'_>,
    chain: &[Selector],
    base: &Url,
) -> Result<Option<(String, String)>, AdapterError> {
    let Some(anchor) = first_in(scope, chain) else {
        return Ok(None);
    };
    let title = element_text(anchor);
    let href = anchor.value().attr("href").map(str::trim).unwrap_or_default();
    if title.is_empty() || href.is_empty() {
        return Ok(None);
    }
    Ok(Some((title, resolve_url(base, href)?)))
}

/// Resolve `href` against the source's base URL; absolute links pass through.
pub fn resolve_url(base: &Url, href: &str) -> Result<String, AdapterError> {
    base.join(href)
        .map(|u| u.to_string())
        .map_err(|source| AdapterError::Link {
            href: href.to_string(),
            source,
        })
}

/// Parse each listing element in isolation; one bad element never costs the page.
pub(crate) fn collect_listings<'a, I, F>(source: &str, elements: I, mut parse: F) -> ListingPage
where
    I: IntoIterator<Item = ElementRef<'a>>,
    F: FnMut(ElementRef<'a>) -> Result<Option<Candidate>, AdapterError>,
{
    let mut page = ListingPage::default();
    for element in elements {
        page.elements += 1;
        match parse(element) {
            Ok(Some(candidate)) => page.candidates.push(candidate),
            Ok(None) => debug!(source, "listing element without title link, skipped"),
            Err(err) => warn!(source, error = %err, "failed to parse listing element"),
        }
    }
    page
}
