//! ScholarshipDb.net country listings.

use async_trait::async_trait;
use phdc_core::{truncate_chars, Candidate, Region, MAX_DESCRIPTION_CHARS};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::{
    chain_text, collect_listings, compile_chain, compile_selector, element_text, parse_base_url,
    title_link, AdapterError, ListingPage, ScrapePlan, SourceExtractor,
};

pub(crate) const SOURCE_ID: &str = "scholarshipdb";

// Listings are bare <li> elements; the heading is what tells them apart from navigation.
const LISTING: &str = "li";
const LISTING_MARKER: &str = "h4";
const TITLE_LINK: &[&str] = &["h4 a"];
const META_UNIVERSITY: &str = "a";
const META_COUNTRY: &str = "a.text-success";
const DESCRIPTION: &[&str] = &["p", "small"];

/// Index of the meta block among the listing's direct `div` children.
const META_DIV_INDEX: usize = 1;

pub struct ScholarshipDbExtractor {
    plan: ScrapePlan,
    base: Url,
    listing: Selector,
    listing_marker: Selector,
    title_link: Vec<Selector>,
    meta_university: Selector,
    meta_country: Selector,
    description: Vec<Selector>,
}

impl ScholarshipDbExtractor {
    pub fn new(plan: ScrapePlan) -> Result<Self, AdapterError> {
        Ok(Self {
            base: parse_base_url(&plan.base_url)?,
            plan,
            listing: compile_selector(LISTING)?,
            listing_marker: compile_selector(LISTING_MARKER)?,
            title_link: compile_chain(TITLE_LINK)?,
            meta_university: compile_selector(META_UNIVERSITY)?,
            meta_country: compile_selector(META_COUNTRY)?,
            description: compile_chain(DESCRIPTION)?,
        })
    }

    fn parse_element(
        &self,
        item: ElementRef<'_>,
        region: Region,
    ) -> Result<Option<Candidate>, AdapterError> {
        let Some((title, url)) = title_link(item, &self.title_link, &self.base)? else {
            return Ok(None);
        };

        let (university, country) = match meta_block(item) {
            Some(meta) => (
                meta.select(&self.meta_university)
                    .next()
                    .map(element_text)
                    .unwrap_or_default(),
                meta.select(&self.meta_country)
                    .next()
                    .map(element_text)
                    .unwrap_or_default(),
            ),
            None => (String::new(), String::new()),
        };

        let description = truncate_chars(&chain_text(item, &self.description), MAX_DESCRIPTION_CHARS);

        Ok(Some(Candidate {
            title,
            url,
            university,
            region: Some(region),
            country,
            description,
            source: SOURCE_ID.to_string(),
            ..Default::default()
        }))
    }
}

/// The second direct `div` child: `<a>University</a> | <a class="text-success">Country</a>`.
fn meta_block(item: ElementRef<'_>) -> Option<ElementRef<'_>> {
    item.children()
        .filter_map(ElementRef::wrap)
        .filter(|child| child.value().name() == "div")
        .nth(META_DIV_INDEX)
}

#[async_trait]
impl SourceExtractor for ScholarshipDbExtractor {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn plan(&self) -> &ScrapePlan {
        &self.plan
    }

    fn dedupe_urls(&self) -> bool {
        true
    }

    fn parse_listing(&self, html: &str, region: Region) -> Result<ListingPage, AdapterError> {
        let document = Html::parse_document(html);
        let listings = document
            .select(&self.listing)
            .filter(|li| li.select(&self.listing_marker).next().is_some());
        Ok(collect_listings(SOURCE_ID, listings, |item| {
            self.parse_element(item, region)
        }))
    }
}
