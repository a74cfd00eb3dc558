//! FindAPhD search results. Registered but disabled by default; the site blocks most
//! automated clients.

use async_trait::async_trait;
use phdc_core::{truncate_chars, Candidate, Region, MAX_DESCRIPTION_CHARS};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::{
    chain_text, collect_listings, compile_chain, first_in, parse_base_url, title_link,
    AdapterError, ListingPage, ScrapePlan, SourceExtractor,
};

pub(crate) const SOURCE_ID: &str = "findaphd";

const LISTING: &[&str] = &[
    "div.phd-result",
    "div.card.phd-result",
    "div[class*='result']",
];
const TITLE_LINK: &[&str] = &[
    "h4 a",
    "a.phd-result__title",
    "a[href*='/phds/project/']",
];
const UNIVERSITY: &[&str] = &[
    "a.phd-result__dept-inst",
    "span.phd-result__dept-inst",
    "a[href*='/institutions/']",
];
const DEPARTMENT: &[&str] = &["a.phd-result__dept", "span.phd-result__dept"];
const SUPERVISOR: &[&str] = &["a[href*='/supervisors/']", "span.phd-result__supervisor"];
const DEADLINE: &[&str] = &[
    "span.phd-result__key-info__deadline",
    "div.phd-result__deadline",
];
const COUNTRY: &[&str] = &["span.phd-result__dept-country", "img.phd-result__flag"];
const DESCRIPTION: &[&str] = &["div.phd-result__description", "div.descFrag"];
const SUBJECT: &[&str] = &["a.phd-result__subject"];

pub struct FindAPhdExtractor {
    plan: ScrapePlan,
    base: Url,
    listing: Vec<Selector>,
    title_link: Vec<Selector>,
    university: Vec<Selector>,
    department: Vec<Selector>,
    supervisor: Vec<Selector>,
    deadline: Vec<Selector>,
    country: Vec<Selector>,
    description: Vec<Selector>,
    subject: Vec<Selector>,
}

impl FindAPhdExtractor {
    pub fn new(plan: ScrapePlan) -> Result<Self, AdapterError> {
        Ok(Self {
            base: parse_base_url(&plan.base_url)?,
            plan,
            listing: compile_chain(LISTING)?,
            title_link: compile_chain(TITLE_LINK)?,
            university: compile_chain(UNIVERSITY)?,
            department: compile_chain(DEPARTMENT)?,
            supervisor: compile_chain(SUPERVISOR)?,
            deadline: compile_chain(DEADLINE)?,
            country: compile_chain(COUNTRY)?,
            description: compile_chain(DESCRIPTION)?,
            subject: compile_chain(SUBJECT)?,
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

        Ok(Some(Candidate {
            title,
            url,
            university: chain_text(item, &self.university),
            department: chain_text(item, &self.department),
            supervisor: chain_text(item, &self.supervisor),
            region: Some(region),
            country: self.country(item),
            discipline: chain_text(item, &self.subject),
            deadline: chain_text(item, &self.deadline),
            description: truncate_chars(&chain_text(item, &self.description), MAX_DESCRIPTION_CHARS),
            source: SOURCE_ID.to_string(),
            ..Default::default()
        }))
    }

    /// Flag images carry the country in `title`; text spans carry it inline.
    fn country(&self, item: ElementRef<'_>) -> String {
        let Some(el) = first_in(item, &self.country) else {
            return String::new();
        };
        match el.value().attr("title").map(str::trim) {
            Some(title) if !title.is_empty() => title.to_string(),
            _ => crate::element_text(el),
        }
    }
}

#[async_trait]
impl SourceExtractor for FindAPhdExtractor {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn plan(&self) -> &ScrapePlan {
        &self.plan
    }

    fn parse_listing(&self, html: &str, region: Region) -> Result<ListingPage, AdapterError> {
        let document = Html::parse_document(html);
        // First listing selector that matches anything wins; later ones are layout fallbacks.
        let listings: Vec<ElementRef<'_>> = self
            .listing
            .iter()
            .map(|sel| document.select(sel).collect::<Vec<_>>())
            .find(|found| !found.is_empty())
            .unwrap_or_default();
        Ok(collect_listings(SOURCE_ID, listings, |item| {
            self.parse_element(item, region)
        }))
    }
}
