use phdc_core::Candidate;

/// Everything from this marker on is campaign tracking, not listing identity.
pub const TRACKING_MARKER: &str = "?utm";

/// Trim every field, drop candidates without a title or URL, and strip tracking suffixes.
pub fn normalize(candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.into_iter().filter_map(normalize_one).collect()
}

fn normalize_one(mut candidate: Candidate) -> Option<Candidate> {
    for field in candidate.text_fields_mut() {
        let trimmed = field.trim();
        if trimmed.len() != field.len() {
            *field = trimmed.to_string();
        }
    }
    if candidate.title.is_empty() || candidate.url.is_empty() {
        return None;
    }
    candidate.url = strip_tracking(&candidate.url).to_string();
    Some(candidate)
}

pub fn strip_tracking(url: &str) -> &str {
    url.split(TRACKING_MARKER).next().unwrap_or(url)
}
