//! Keyword classification of funding, discipline and region labels.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use phdc_core::{Candidate, Region, LABEL_SEPARATOR, UNKNOWN_FUNDING};
use serde::Deserialize;

const BUILTIN_FUNDING: &str = include_str!("../../../rules/funding.yaml");
const BUILTIN_DISCIPLINES: &str = include_str!("../../../rules/disciplines.yaml");
const BUILTIN_REGIONS: &str = include_str!("../../../rules/regions.yaml");

#[derive(Debug, Clone, Deserialize)]
struct KeywordRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    rules: Vec<KeywordRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeywordRule {
    pub category: String,
    pub contains_any: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegionLabelsFile {
    #[allow(dead_code)]
    version: u32,
    labels: BTreeMap<Region, String>,
}

/// Ordered keyword rules; a category matches when any of its keywords occurs in the text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordTable {
    rules: Vec<KeywordRule>,
}

impl KeywordTable {
    pub fn new(rules: Vec<KeywordRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| KeywordRule {
                contains_any: rule.contains_any.iter().map(|k| k.to_lowercase()).collect(),
                ..rule
            })
            .collect();
        Self { rules }
    }

    fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        let file: KeywordRulesFile = serde_yaml::from_str(text)?;
        Ok(Self::new(file.rules))
    }

    /// Matched categories in declaration order.
    pub fn matches(&self, text: &str) -> Vec<String> {
        let haystack = text.to_lowercase();
        self.rules
            .iter()
            .filter(|rule| rule.contains_any.iter().any(|needle| haystack.contains(needle.as_str())))
            .map(|rule| rule.category.clone())
            .collect()
    }
}

pub struct Classifier {
    funding: KeywordTable,
    disciplines: KeywordTable,
    region_labels: BTreeMap<Region, String>,
}

impl Classifier {
    pub fn new(
        funding: KeywordTable,
        disciplines: KeywordTable,
        region_labels: BTreeMap<Region, String>,
    ) -> Self {
        Self {
            funding,
            disciplines,
            region_labels,
        }
    }

    /// Tables compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_sources(BUILTIN_FUNDING, BUILTIN_DISCIPLINES, BUILTIN_REGIONS)
            .context("parsing built-in rules")
    }

    /// Load `rules/{funding,disciplines,regions}.yaml` from the workspace root.
    pub fn from_workspace_root(root: &Path) -> Result<Self> {
        let rules_dir = root.join("rules");
        let read = |name: &str| {
            let path = rules_dir.join(name);
            std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
        };
        Self::from_sources(
            &read("funding.yaml")?,
            &read("disciplines.yaml")?,
            &read("regions.yaml")?,
        )
        .with_context(|| format!("parsing rules in {}", rules_dir.display()))
    }

    /// Workspace rules when `rules/` exists there, built-in tables otherwise.
    pub fn for_workspace(root: &Path) -> Result<Self> {
        if root.join("rules").is_dir() {
            Self::from_workspace_root(root)
        } else {
            Self::builtin()
        }
    }

    fn from_sources(funding: &str, disciplines: &str, regions: &str) -> Result<Self> {
        let funding = KeywordTable::from_yaml(funding).context("funding rules")?;
        let disciplines = KeywordTable::from_yaml(disciplines).context("discipline rules")?;
        let regions: RegionLabelsFile = serde_yaml::from_str(regions).context("region labels")?;
        Ok(Self::new(funding, disciplines, regions.labels))
    }

    /// Funding categories, or exactly `["unknown"]` when nothing matches.
    pub fn classify_funding(&self, text: &str) -> Vec<String> {
        let matched = self.funding.matches(text);
        if matched.is_empty() {
            vec![UNKNOWN_FUNDING.to_string()]
        } else {
            matched
        }
    }

    /// Every matching discipline in table order. Not capped at two; all matches are kept.
    pub fn classify_discipline(&self, text: &str) -> Vec<String> {
        self.disciplines.matches(text)
    }

    pub fn region_label(&self, region: Region) -> &str {
        self.region_labels
            .get(&region)
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Fill funding always, discipline only when markup supplied none, and the region label.
    pub fn enrich(&self, candidate: &mut Candidate) {
        let funding_text = format!(
            "{} {} {}",
            candidate.title, candidate.description, candidate.deadline
        );
        candidate.funding_type = self.classify_funding(&funding_text).join(LABEL_SEPARATOR);

        if candidate.discipline.is_empty() {
            let discipline_text = format!("{} {}", candidate.title, candidate.description);
            candidate.discipline = self
                .classify_discipline(&discipline_text)
                .join(LABEL_SEPARATOR);
        }

        if let Some(region) = candidate.region {
            candidate.region_label = self.region_label(region).to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> Classifier {
        Classifier::builtin().unwrap()
    }

    #[test]
    fn funding_categories_follow_table_order() {
        let c = classifier();
        assert_eq!(
            c.classify_funding("Rolling basis review. This is a FULLY FUNDED studentship."),
            vec!["fully_funded", "rolling"]
        );
        assert_eq!(
            c.classify_funding("岗位制 PhD, China Scholarship Council applicants welcome"),
            vec!["csc", "position"]
        );
    }

    #[test]
    fn funding_defaults_to_unknown() {
        assert_eq!(classifier().classify_funding("PhD in topology"), vec!["unknown"]);
        assert_eq!(classifier().classify_funding(""), vec!["unknown"]);
    }

    #[test]
    fn discipline_matches_every_category_without_cap() {
        let c = classifier();
        assert_eq!(
            c.classify_discipline("Machine learning for marine ecology and climate policy"),
            vec![
                "Computer Science",
                "Biology",
                "Environmental Science",
                "Social Sciences"
            ]
        );
        assert!(c.classify_discipline("Untitled").is_empty());
    }

    #[test]
    fn classification_is_deterministic() {
        let c = classifier();
        let text = "Fully funded position in quantum optics, salary per agreement";
        let first = c.classify_funding(text);
        for _ in 0..5 {
            assert_eq!(c.classify_funding(text), first);
        }
    }

    #[test]
    fn enrich_keeps_markup_discipline_and_sets_labels() {
        let c = classifier();
        let mut candidate = Candidate {
            title: "Doctoral researcher".into(),
            description: "Employed for four years".into(),
            deadline: "Open until filled".into(),
            discipline: "Physics".into(),
            region: Some(Region::NorthAmerica),
            ..Candidate::new("", "")
        };
        c.enrich(&mut candidate);
        assert_eq!(candidate.funding_type, "rolling, position");
        assert_eq!(candidate.discipline, "Physics");
        assert_eq!(candidate.region_label, "北美");

        let mut bare = Candidate::new("PhD in Statistics", "https://x.org/1");
        c.enrich(&mut bare);
        assert_eq!(bare.funding_type, "unknown");
        assert_eq!(bare.discipline, "Mathematics");
        assert_eq!(bare.region_label, "");
    }

    #[test]
    fn workspace_rules_override_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let rules = dir.path().join("rules");
        std::fs::create_dir_all(&rules).unwrap();
        std::fs::write(
            rules.join("funding.yaml"),
            "version: 1\nrules:\n  - category: stipend\n    contains_any: [\"Stipend\"]\n",
        )
        .unwrap();
        std::fs::write(rules.join("disciplines.yaml"), "version: 1\nrules: []\n").unwrap();
        std::fs::write(
            rules.join("regions.yaml"),
            "version: 1\nlabels:\n  europe: Europe\n",
        )
        .unwrap();

        let c = Classifier::for_workspace(dir.path()).unwrap();
        assert_eq!(c.classify_funding("monthly stipend"), vec!["stipend"]);
        assert_eq!(c.region_label(Region::Europe), "Europe");
        assert_eq!(c.region_label(Region::Australia), "");
    }

    #[test]
    fn missing_rules_dir_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let c = Classifier::for_workspace(dir.path()).unwrap();
        assert_eq!(c.region_label(Region::Australia), "澳洲");
    }
}
