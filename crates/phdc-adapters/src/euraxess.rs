//! EURAXESS researcher job portal (first-stage researcher / R1 positions).

use async_trait::async_trait;
use phdc_core::{truncate_chars, Candidate, Region, MAX_DESCRIPTION_CHARS};
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::{
    chain_text, collect_listings, compile_chain, compile_selector, element_text, first_in,
    parse_base_url, title_link, AdapterError, ListingPage, ScrapePlan, SourceExtractor,
};

pub(crate) const SOURCE_ID: &str = "euraxess";

const LISTING: &str = "div.ecl-content-item__content-block";
const TITLE_LINK: &[&str] = &["h3.ecl-content-block__title a", "h3 a"];
const ORGANISATION: &[&str] = &[
    "ul.ecl-content-block__primary-meta-container li a",
    "ul.ecl-content-block__primary-meta-container li",
];
const WORK_LOCATIONS: &[&str] = &["div.id-Work-Locations"];
const RESEARCH_FIELD: &str = "div.id-Research-Field";
const RESEARCH_FIELD_LINK: &str = "a";
const DEADLINE: &[&str] = &["div.id-Application-Deadline time", "time[datetime]"];
const DESCRIPTION: &[&str] = &["div.ecl-content-block__description", "p"];

const MAX_RESEARCH_FIELDS: usize = 3;

pub struct EuraxessExtractor {
    plan: ScrapePlan,
    base: Url,
    listing: Selector,
    title_link: Vec<Selector>,
    organisation: Vec<Selector>,
    work_locations: Vec<Selector>,
    research_field: Selector,
    research_field_link: Selector,
    deadline: Vec<Selector>,
    description: Vec<Selector>,
}

impl EuraxessExtractor {
    pub fn new(plan: ScrapePlan) -> Result<Self, AdapterError> {
        Ok(Self {
            base: parse_base_url(&plan.base_url)?,
            plan,
            listing: compile_selector(LISTING)?,
            title_link: compile_chain(TITLE_LINK)?,
            organisation: compile_chain(ORGANISATION)?,
            work_locations: compile_chain(WORK_LOCATIONS)?,
            research_field: compile_selector(RESEARCH_FIELD)?,
            research_field_link: compile_selector(RESEARCH_FIELD_LINK)?,
            deadline: compile_chain(DEADLINE)?,
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

        let mut university = chain_text(item, &self.organisation);
        let mut country = String::new();
        if let Some(locations) = first_in(item, &self.work_locations) {
            let (loc_country, loc_university) = split_work_locations(&element_text(locations));
            country = loc_country;
            if university.is_empty() {
                university = loc_university;
            }
        }

        let discipline = item
            .select(&self.research_field)
            .next()
            .map(|field| research_fields(field, &self.research_field_link))
            .unwrap_or_default();

        let description = truncate_chars(&chain_text(item, &self.description), MAX_DESCRIPTION_CHARS);

        Ok(Some(Candidate {
            title,
            url,
            university,
            region: Some(region),
            country,
            discipline,
            deadline: chain_text(item, &self.deadline),
            description,
            source: SOURCE_ID.to_string(),
            ..Default::default()
        }))
    }
}

#[async_trait]
impl SourceExtractor for EuraxessExtractor {
    fn source_id(&self) -> &'static str {
        SOURCE_ID
    }

    fn plan(&self) -> &ScrapePlan {
        &self.plan
    }

    fn parse_listing(&self, html: &str, region: Region) -> Result<ListingPage, AdapterError> {
        let document = Html::parse_document(html);
        Ok(collect_listings(
            SOURCE_ID,
            document.select(&self.listing),
            |item| self.parse_element(item, region),
        ))
    }
}

/// Split the work-locations block into `(country, university)`.
///
/// The block reads `Work Locations: Number of offers: 1, Germany, TU Munich, Munich`; after
/// the labels are removed the offer count comes first, then country, then institution.
fn split_work_locations(text: &str) -> (String, String) {
    let cleaned = text
        .replace("Work Locations:", "")
        .replace("Number of offers:", "");
    let parts: Vec<&str> = cleaned
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let country = parts.get(1).map(|s| s.to_string()).unwrap_or_default();
    let university = parts.get(2).map(|s| s.to_string()).unwrap_or_default();
    (country, university)
}

/// Up to three distinct research-field link texts, in page order.
fn research_fields(field: ElementRef<'_>, link: &Selector) -> String {
    let mut fields: Vec<String> = Vec::new();
    for text in field.select(link).map(element_text) {
        if !text.is_empty() && !fields.contains(&text) {
            fields.push(text);
        }
    }
    fields.truncate(MAX_RESEARCH_FIELDS);
    fields.join(phdc_core::LABEL_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PagingScheme;

    fn extractor() -> EuraxessExtractor {
        EuraxessExtractor::new(ScrapePlan {
            base_url: "https://euraxess.ec.europa.eu".into(),
            targets: vec![],
            paging: PagingScheme::Template { first_page: 0 },
            max_pages: 3,
        })
        .unwrap()
    }

    #[test]
    fn work_locations_yield_country_then_university() {
        let (country, university) = split_work_locations(
            "Work Locations: Number of offers: 2, Germany, Technical University of Munich, Munich",
        );
        assert_eq!(country, "Germany");
        assert_eq!(university, "Technical University of Munich");

        assert_eq!(
            split_work_locations("Work Locations: Number of offers: 1"),
            (String::new(), String::new())
        );
    }

    #[test]
    fn research_fields_are_distinct_and_capped() {
        let html = Html::parse_fragment(
            r#"<div class="id-Research-Field">
                 <a>Physics</a><a>Physics</a><a>Chemistry</a><a>Biology</a><a>Mathematics</a>
               </div>"#,
        );
        let link = compile_selector("a").unwrap();
        assert_eq!(
            research_fields(html.root_element(), &link),
            "Physics, Chemistry, Biology"
        );
    }

    #[test]
    fn organisation_falls_back_to_work_locations() {
        let html = r#"
          <div class="ecl-content-item__content-block">
            <h3 class="ecl-content-block__title"><a href="/jobs/1"><span>R1 Marine Ecology</span></a></h3>
            <div class="id-Work-Locations">Work Locations: Number of offers: 1, Norway, University of Bergen, Bergen</div>
          </div>"#;
        let page = extractor().parse_listing(html, Region::Europe).unwrap();
        assert_eq!(page.elements, 1);
        let c = &page.candidates[0];
        assert_eq!(c.title, "R1 Marine Ecology");
        assert_eq!(c.url, "https://euraxess.ec.europa.eu/jobs/1");
        assert_eq!(c.university, "University of Bergen");
        assert_eq!(c.country, "Norway");
        assert_eq!(c.deadline, "");
        assert_eq!(c.source, "euraxess");
    }

    #[test]
    fn description_is_capped() {
        let long = "x".repeat(MAX_DESCRIPTION_CHARS + 500);
        let html = format!(
            r#"<div class="ecl-content-item__content-block">
                 <h3 class="ecl-content-block__title"><a href="/jobs/2">PhD</a></h3>
                 <div class="ecl-content-block__description">{long}</div>
               </div>"#
        );
        let page = extractor().parse_listing(&html, Region::Europe).unwrap();
        assert_eq!(page.candidates[0].description.chars().count(), MAX_DESCRIPTION_CHARS);
    }
}
