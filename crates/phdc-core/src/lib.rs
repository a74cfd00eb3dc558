//! Core domain model for the PhD listing collector.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound on stored description length, in characters.
pub const MAX_DESCRIPTION_CHARS: usize = 2000;

/// Funding label used when no funding keyword matches.
pub const UNKNOWN_FUNDING: &str = "unknown";

/// Separator for multi-valued labels (`funding_type`, `discipline`).
pub const LABEL_SEPARATOR: &str = ", ";

/// Coarse geographic grouping used for source scoping and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Europe,
    Australia,
    NorthAmerica,
}

impl Region {
    pub const ALL: [Region; 3] = [Region::Europe, Region::Australia, Region::NorthAmerica];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Europe => "europe",
            Region::Australia => "australia",
            Region::NorthAmerica => "north_america",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "europe" => Ok(Region::Europe),
            "australia" => Ok(Region::Australia),
            "north_america" => Ok(Region::NorthAmerica),
            other => Err(format!("unknown region `{other}`")),
        }
    }
}

/// A listing as scraped, before it is persisted.
///
/// Every descriptive field is a plain string; a field the extractor could not find is empty
/// rather than absent, so downstream stages never distinguish "missing" from "blank".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub title: String,
    pub url: String,
    pub university: String,
    pub department: String,
    pub supervisor: String,
    pub region: Option<Region>,
    pub region_label: String,
    pub country: String,
    pub funding_type: String,
    pub discipline: String,
    pub deadline: String,
    pub description: String,
    pub source: String,
}

impl Candidate {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Mutable access to every string-valued field, for whole-record passes like trimming.
    pub fn text_fields_mut(&mut self) -> [&mut String; 12] {
        [
            &mut self.title,
            &mut self.url,
            &mut self.university,
            &mut self.department,
            &mut self.supervisor,
            &mut self.region_label,
            &mut self.country,
            &mut self.funding_type,
            &mut self.discipline,
            &mut self.deadline,
            &mut self.description,
            &mut self.source,
        ]
    }

    pub fn region_str(&self) -> &'static str {
        self.region.map(|r| r.as_str()).unwrap_or_default()
    }
}

/// Persisted listing row of the `phd_projects` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub id: i64,
    pub title: String,
    pub university: String,
    pub department: String,
    pub supervisor: String,
    pub region: String,
    pub region_label: String,
    pub country: String,
    pub funding_type: String,
    pub discipline: String,
    pub deadline: String,
    pub description: String,
    pub url: String,
    pub source: String,
    pub is_new: bool,
    pub collected_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate counters for one collection run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    /// Candidates produced by extractors, counted before normalization.
    pub total_scraped: usize,
    pub new_saved: usize,
    /// Already-known listings, whether or not any field changed.
    pub duplicates: usize,
    /// Sources that failed as a whole.
    pub errors: usize,
    /// Upsert batches that were rolled back.
    pub storage_failures: usize,
}

impl fmt::Display for CollectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total_scraped={} new_saved={} duplicates={} errors={} storage_failures={}",
            self.total_scraped, self.new_saved, self.duplicates, self.errors, self.storage_failures
        )
    }
}

/// Truncate to at most `max` characters, respecting char boundaries.
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
