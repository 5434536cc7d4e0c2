//! Core posting model, identity hashing and completeness scoring for WGOF.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "wgof-core";

/// Organization-type markers removed before hashing so that
/// "Game & Fish (State)" and "Game & Fish" resolve to the same position.
pub const ORGANIZATION_TYPE_MARKERS: [&str; 3] = ["(state)", "(federal)", "(private)"];

/// Fields counted by [`Posting::completeness_score`], in serialized form.
pub const COMPLETENESS_FIELDS: [&str; 13] = [
    "title",
    "organization",
    "location",
    "salary_range",
    "application_deadline",
    "published_date",
    "starting_date",
    "hours_per_week",
    "education_required",
    "experience_required",
    "description",
    "job_id",
    "url",
];

/// Subset of fields that carry structured (rather than free-form) detail.
pub const STRUCTURED_FIELDS: [&str; 6] = [
    "salary_range",
    "application_deadline",
    "published_date",
    "starting_date",
    "hours_per_week",
    "education_required",
];

#[derive(Debug, Error)]
pub enum PostingError {
    #[error("posting title is blank")]
    MissingTitle,
    #[error("posting record is not a JSON object")]
    NotAnObject,
    #[error("invalid posting record: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Human triage bucket for a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewPriority {
    Low,
    Medium,
    High,
}

impl ReviewPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewPriority::Low => "low",
            ReviewPriority::Medium => "medium",
            ReviewPriority::High => "high",
        }
    }
}

/// One job or assistantship listing.
///
/// Scraped text fields default to the empty string. Provenance timestamps are
/// owned by the merge engine, and the derived block below is recomputed by the
/// annotation pipeline on every merge; nothing upstream should set it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Posting {
    #[serde(default, deserialize_with = "lenient_string")]
    pub title: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub organization: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub location: String,
    #[serde(rename = "salary_range", default, deserialize_with = "lenient_string")]
    pub salary_text: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub application_deadline: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub published_date: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub starting_date: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub hours_per_week: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub education_required: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub experience_required: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub job_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub url: String,
    #[serde(default, deserialize_with = "lenient_tags")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_timestamp")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_timestamp")]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub data_enhanced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_timestamp")]
    pub enhanced_at: Option<DateTime<Utc>>,

    // Derived annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completeness_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary_numeric: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary_annualized: Option<f64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub salary_monthly_reclassified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary_adjusted: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_of_living_index: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub employer_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub big_ten: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_on: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_graduate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grad_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grad_reasons: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discipline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discipline_category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_priority: Option<ReviewPriority>,

    /// Keys this model does not know about, kept so a rewrite never drops them.
    #[serde(flatten)]
    pub extra: BTreeMap<String, JsonValue>,
}

impl Posting {
    /// Convenience constructor used by tests and tools.
    pub fn new(title: impl Into<String>, organization: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            organization: organization.into(),
            location: location.into(),
            ..Default::default()
        }
    }

    /// Deserialize one raw record. Older scrapes stored the salary under
    /// `salary`; it is promoted into `salary_range` when that is empty.
    pub fn from_json(value: JsonValue) -> Result<Self, PostingError> {
        if !value.is_object() {
            return Err(PostingError::NotAnObject);
        }
        let mut posting: Posting = serde_json::from_value(value)?;
        if posting.salary_text.trim().is_empty() {
            if let Some(JsonValue::String(legacy)) = posting.extra.get("salary") {
                posting.salary_text = legacy.clone();
                posting.extra.remove("salary");
            }
        }
        Ok(posting)
    }

    pub fn validate(&self) -> Result<(), PostingError> {
        if self.title.trim().is_empty() {
            return Err(PostingError::MissingTitle);
        }
        Ok(())
    }

    pub fn identity_hash(&self) -> String {
        identity_hash(&self.title, &self.organization, &self.location)
    }

    fn designated_fields(&self) -> [&str; 13] {
        [
            self.title.as_str(),
            self.organization.as_str(),
            self.location.as_str(),
            self.salary_text.as_str(),
            self.application_deadline.as_str(),
            self.published_date.as_str(),
            self.starting_date.as_str(),
            self.hours_per_week.as_str(),
            self.education_required.as_str(),
            self.experience_required.as_str(),
            self.description.as_str(),
            self.job_id.as_str(),
            self.url.as_str(),
        ]
    }

    fn structured_fields(&self) -> [&str; 6] {
        [
            self.salary_text.as_str(),
            self.application_deadline.as_str(),
            self.published_date.as_str(),
            self.starting_date.as_str(),
            self.hours_per_week.as_str(),
            self.education_required.as_str(),
        ]
    }

    /// Fraction of [`COMPLETENESS_FIELDS`] holding non-blank text. Only
    /// meaningful relative to another version of the same posting.
    pub fn completeness_score(&self) -> f64 {
        let fields = self.designated_fields();
        let filled = fields.iter().filter(|v| is_populated(v)).count();
        filled as f64 / fields.len() as f64
    }

    pub fn structured_field_count(&self) -> usize {
        self.structured_fields()
            .iter()
            .filter(|v| is_populated(v))
            .count()
    }

    /// Replace every scraped and derived field with `incoming`'s, keeping
    /// `first_seen` and any stored extra keys the incoming record lacks.
    pub fn overwrite_from(&mut self, mut incoming: Posting) {
        let first_seen = self.first_seen;
        let mut extra = std::mem::take(&mut self.extra);
        extra.append(&mut incoming.extra);
        *self = incoming;
        self.first_seen = first_seen;
        self.extra = extra;
    }
}

fn is_populated(value: &str) -> bool {
    !value.trim().is_empty()
}

/// Lowercase, trim and fold en/em dashes to `-`.
pub fn normalize_identity_component(input: &str) -> String {
    input
        .trim()
        .to_lowercase()
        .replace(['\u{2013}', '\u{2014}'], "-")
}

pub fn normalize_identity_organization(input: &str) -> String {
    let mut org = normalize_identity_component(input);
    for marker in ORGANIZATION_TYPE_MARKERS {
        org = org.replace(marker, "");
    }
    org.trim().to_string()
}

/// MD5 hex digest of the normalized `title|organization|location` triple.
pub fn identity_hash(title: &str, organization: &str, location: &str) -> String {
    let key = format!(
        "{}|{}|{}",
        normalize_identity_component(title),
        normalize_identity_organization(organization),
        normalize_identity_component(location)
    );
    format!("{:x}", md5::compute(key.as_bytes()))
}

/// Per-category counters for one merge run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    /// Records loaded from the historical store(s) before reconciliation.
    pub historical_preserved: usize,
    pub new_added: usize,
    pub updated: usize,
    pub enhanced: usize,
    /// Historical records the incoming batch did not touch.
    pub preserved: usize,
    #[serde(default)]
    pub skipped: usize,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s,
        Some(other) => other.to_string(),
    })
}

/// RFC 3339 first, then naive ISO forms read as UTC. Blank is `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(at) = raw.parse::<DateTime<Utc>>() {
        return Some(at);
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(JsonValue::Null) => None,
        Some(JsonValue::String(s)) => {
            let parsed = parse_timestamp(&s);
            if parsed.is_none() && !s.trim().is_empty() {
                warn!(raw = %s, "unparsable timestamp; dropping it");
            }
            parsed
        }
        Some(other) => {
            warn!(raw = %other, "timestamp is not a string; dropping it");
            None
        }
    })
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(JsonValue::Null) => false,
        Some(JsonValue::Bool(b)) => b,
        Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(JsonValue::String(s)) => matches!(s.trim().to_lowercase().as_str(), "true" | "yes" | "1"),
        Some(other) => {
            warn!(raw = %other, "flag is not a boolean; treating it as false");
            false
        }
    })
}

fn lenient_tags<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    let raw: Vec<String> = match value {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::String(s)) => s.split(',').map(ToString::to_string).collect(),
        Some(JsonValue::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                JsonValue::String(s) => s,
                other => other.to_string(),
            })
            .collect(),
        Some(other) => vec![other.to_string()],
    };

    let mut tags: Vec<String> = Vec::with_capacity(raw.len());
    for tag in raw {
        let tag = tag.trim();
        if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
            tags.push(tag.to_string());
        }
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_posting() -> Posting {
        Posting {
            title: "MS Assistantship".into(),
            organization: "Utah State University".into(),
            location: "Logan, Utah".into(),
            salary_text: "$24,000 per year".into(),
            description: "Study sage-grouse movement.".into(),
            ..Default::default()
        }
    }

    #[test]
    fn identity_ignores_non_key_fields() {
        let a = full_posting();
        let mut b = full_posting();
        b.salary_text = "Commensurate".into();
        b.description.clear();
        b.url = "https://example.org/job/1".into();
        assert_eq!(a.identity_hash(), b.identity_hash());
    }

    #[test]
    fn identity_normalizes_case_dashes_and_org_markers() {
        let a = identity_hash(
            "PhD Assistantship \u{2013} Bat Ecology",
            "Texas Parks and Wildlife (State)",
            " Austin, Texas ",
        );
        let b = identity_hash(
            "phd assistantship - bat ecology",
            "texas parks and wildlife",
            "austin, texas",
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identity_distinguishes_titles() {
        let a = identity_hash("Test Position", "Test University", "Test, TX");
        let b = identity_hash("Different Position", "Test University", "Test, TX");
        assert_ne!(a, b);
    }

    #[test]
    fn identity_hash_matches_known_digest() {
        assert_eq!(identity_hash("", "", ""), format!("{:x}", md5::compute(b"||")));
    }

    #[test]
    fn completeness_counts_thirteen_fields() {
        assert_eq!(COMPLETENESS_FIELDS.len(), 13);
        assert!(STRUCTURED_FIELDS
            .iter()
            .all(|field| COMPLETENESS_FIELDS.contains(field)));

        let empty = Posting::default();
        assert_eq!(empty.completeness_score(), 0.0);

        let posting = full_posting();
        assert!((posting.completeness_score() - 5.0 / 13.0).abs() < 1e-9);
        assert_eq!(posting.structured_field_count(), 1);
    }

    #[test]
    fn completeness_is_monotonic() {
        let mut posting = full_posting();
        let mut previous = posting.completeness_score();
        let setters: [fn(&mut Posting); 8] = [
            |p| p.application_deadline = "07/01/2025".into(),
            |p| p.published_date = "06/20/2025".into(),
            |p| p.starting_date = "Fall 2025".into(),
            |p| p.hours_per_week = "20".into(),
            |p| p.education_required = "BS".into(),
            |p| p.experience_required = "Field work".into(),
            |p| p.job_id = "12345".into(),
            |p| p.url = "https://example.org".into(),
        ];
        for set in setters {
            set(&mut posting);
            let score = posting.completeness_score();
            assert!(score > previous);
            previous = score;
        }
        assert!((previous - 1.0).abs() < 1e-9);
    }

    #[test]
    fn whitespace_is_not_populated() {
        let mut posting = full_posting();
        let before = posting.completeness_score();
        posting.url = "   ".into();
        assert_eq!(posting.completeness_score(), before);
    }

    #[test]
    fn from_json_coerces_loose_field_types() {
        let posting = Posting::from_json(json!({
            "title": "Graduate Assistantship",
            "hours_per_week": 20,
            "description": null,
            "tags": "Graduate Opportunities, Graduate Opportunities,  Wildlife ",
            "salary": "$1,800 per month",
            "discipline_primary": "Wildlife Ecology"
        }))
        .unwrap();

        assert_eq!(posting.hours_per_week, "20");
        assert_eq!(posting.description, "");
        assert_eq!(posting.tags, vec!["Graduate Opportunities", "Wildlife"]);
        assert_eq!(posting.salary_text, "$1,800 per month");
        assert!(!posting.extra.contains_key("salary"));
        assert_eq!(posting.extra["discipline_primary"], json!("Wildlife Ecology"));
    }

    #[test]
    fn from_json_rejects_non_objects() {
        assert!(matches!(
            Posting::from_json(json!(["not", "a", "record"])),
            Err(PostingError::NotAnObject)
        ));
    }

    #[test]
    fn unknown_keys_survive_a_round_trip() {
        let posting = Posting::from_json(json!({
            "title": "Fisheries Technician",
            "scraped_by": "selenium",
            "first_seen": "2025-06-20T12:00:00+00:00"
        }))
        .unwrap();
        let value = serde_json::to_value(&posting).unwrap();
        assert_eq!(value["scraped_by"], json!("selenium"));
        assert_eq!(value["salary_range"], json!(""));
        assert!(value.get("identity_hash").is_none());
        assert_eq!(
            posting.first_seen.unwrap().to_rfc3339(),
            "2025-06-20T12:00:00+00:00"
        );
    }

    #[test]
    fn naive_timestamps_are_read_as_utc() {
        let posting = Posting::from_json(json!({
            "title": "Wildlife Technician",
            "first_seen": "2025-06-20T12:00:00.123456",
            "last_updated": "2025-06-21 08:30:00",
            "enhanced_at": "2025-06-22"
        }))
        .expect("posting");

        let first_seen = NaiveDate::from_ymd_opt(2025, 6, 20)
            .and_then(|d| d.and_hms_micro_opt(12, 0, 0, 123_456))
            .expect("date")
            .and_utc();
        assert_eq!(posting.first_seen, Some(first_seen));
        assert_eq!(
            posting.last_updated.expect("last_updated").to_rfc3339(),
            "2025-06-21T08:30:00+00:00"
        );
        assert_eq!(
            posting.enhanced_at.expect("enhanced_at").to_rfc3339(),
            "2025-06-22T00:00:00+00:00"
        );
    }

    #[test]
    fn bad_provenance_fields_default_instead_of_failing() {
        let posting = Posting::from_json(json!({
            "title": "Fisheries Technician",
            "first_seen": "",
            "last_updated": "last tuesday",
            "enhanced_at": 1718880000,
            "data_enhanced": null
        }))
        .expect("posting");

        assert_eq!(posting.first_seen, None);
        assert_eq!(posting.last_updated, None);
        assert_eq!(posting.enhanced_at, None);
        assert!(!posting.data_enhanced);

        let flagged = Posting::from_json(json!({"title": "T", "data_enhanced": "true"})).expect("posting");
        assert!(flagged.data_enhanced);
    }

    #[test]
    fn validate_rejects_blank_titles() {
        assert!(matches!(
            Posting::new("   ", "Org", "Somewhere").validate(),
            Err(PostingError::MissingTitle)
        ));
        assert!(full_posting().validate().is_ok());
    }

    #[test]
    fn overwrite_keeps_first_seen_and_stored_extras() {
        let seen = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let mut stored = full_posting();
        stored.first_seen = Some(seen);
        stored.extra.insert("notes".into(), json!("keep me"));

        let mut incoming = full_posting();
        incoming.url = "https://example.org/new".into();
        incoming.extra.insert("source".into(), json!("scrape-2"));

        stored.overwrite_from(incoming);
        assert_eq!(stored.first_seen, Some(seen));
        assert_eq!(stored.url, "https://example.org/new");
        assert_eq!(stored.extra["notes"], json!("keep me"));
        assert_eq!(stored.extra["source"], json!("scrape-2"));
    }

    #[test]
    fn review_priority_orders_high_last() {
        assert!(ReviewPriority::High > ReviewPriority::Medium);
        assert!(ReviewPriority::Medium > ReviewPriority::Low);
        assert_eq!(
            serde_json::to_value(ReviewPriority::High).unwrap(),
            json!("high")
        );
    }
}
