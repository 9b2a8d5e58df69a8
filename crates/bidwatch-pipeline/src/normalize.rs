//! Field normalization from heterogeneous per-source extractions.
//!
//! Every function here degrades to `None`/empty instead of failing: a field
//! the portal formatted strangely becomes a null, never a dead item.

use std::collections::BTreeMap;

use bidwatch_core::{CanonicalRecord, OpportunityStatus, RawRecord};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use tracing::debug;

const LEGAL_SUFFIXES: &[&str] = &[
    "inc", "llc", "ltd", "corp", "corporation", "company", "co", "group", "holdings", "plc", "lp",
    "llp",
];

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("admin", "administration"),
    ("auth", "authority"),
    ("dept", "department"),
    ("div", "division"),
    ("govt", "government"),
    ("mgmt", "management"),
    ("svc", "services"),
    ("svcs", "services"),
];

/// Lowercase, strip legal suffixes, expand common abbreviations, collapse
/// whitespace. Used for agencies and vendors alike so that "Dept. of
/// Transportation" and "DEPARTMENT OF TRANSPORTATION" compare equal.
pub fn normalize_agency_name(name: &str) -> String {
    let mut words = Vec::new();
    let lowercased = name.to_lowercase();
    for word in lowercased
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        if LEGAL_SUFFIXES.contains(&word) {
            continue;
        }
        let word = ABBREVIATIONS
            .iter()
            .find(|(abbrev, _)| *abbrev == word)
            .map(|(_, full)| *full)
            .unwrap_or(word);
        words.push(word);
    }
    words.join(" ")
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%m-%d-%Y", "%B %d, %Y", "%b %d, %Y"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Best-effort date parsing across the formats the portals actually emit.
pub fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return Some(date);
        }
    }
    for format in DATETIME_FORMATS {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(value, format) {
            return Some(datetime.date());
        }
    }
    if let Ok(datetime) = DateTime::parse_from_rfc3339(value) {
        return Some(datetime.date_naive());
    }
    debug!(value, "unparseable date");
    None
}

/// Extract `(amount, currency)` from strings like `"$1,234,567.89"`.
pub fn parse_money(value: &str) -> (Option<f64>, Option<&'static str>) {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return (None, None);
    }
    let lower = trimmed.to_lowercase();
    let currency = if trimmed.contains('€') || lower.contains("eur") {
        Some("EUR")
    } else if trimmed.contains('£') || lower.contains("gbp") {
        Some("GBP")
    } else if trimmed.contains('$') || lower.contains("usd") {
        Some("USD")
    } else {
        None
    };

    let cleaned: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    match cleaned.parse::<f64>() {
        Ok(amount) => (Some(amount), currency),
        Err(_) => {
            debug!(value = trimmed, "unparseable amount");
            (None, currency)
        }
    }
}

/// Keyword status inference over every extracted value.
pub fn infer_status(extracted: &BTreeMap<String, String>) -> OpportunityStatus {
    let text = extracted
        .values()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    if ["awarded", "award"].iter().any(|w| text.contains(w)) {
        return OpportunityStatus::Awarded;
    }
    if ["closed", "expired", "past due"].iter().any(|w| text.contains(w)) {
        return OpportunityStatus::Closed;
    }
    if ["cancelled", "canceled"].iter().any(|w| text.contains(w)) {
        return OpportunityStatus::Cancelled;
    }
    if ["open", "active", "accepting"].iter().any(|w| text.contains(w)) {
        return OpportunityStatus::Active;
    }
    OpportunityStatus::Unknown
}

fn first_value<'a>(extracted: &'a BTreeMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| extracted.get(*key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
}

/// Map one raw extraction into a fresh canonical record. Classification is
/// left at its unknown default for the classify stage to fill in.
pub fn normalize(raw: &RawRecord, now: DateTime<Utc>) -> CanonicalRecord {
    let ext = &raw.extracted;
    let mut record = CanonicalRecord::new(raw.provenance(), now);

    record.title = first_value(ext, &["title", "name"]).unwrap_or_default().to_string();
    record.description = first_value(ext, &["description", "summary", "details"])
        .unwrap_or_default()
        .to_string();
    record.agency = first_value(ext, &["agency", "department", "office"])
        .map(normalize_agency_name)
        .unwrap_or_default();
    record.posted_date =
        first_value(ext, &["posted_date", "publish_date", "posted"]).and_then(parse_date);
    record.due_date = first_value(ext, &["due_date", "close_date", "deadline", "response_due"])
        .and_then(parse_date);
    if let Some(value) = first_value(ext, &["estimated_value", "amount", "value", "award_amount"]) {
        let (amount, currency) = parse_money(value);
        record.estimated_value = amount;
        if let Some(currency) = currency {
            record.currency = currency.to_string();
        }
    }
    record.status = infer_status(ext);
    record
}

fn prefer_longer(a: &str, b: &str) -> String {
    if b.len() > a.len() {
        b.to_string()
    } else {
        a.to_string()
    }
}

/// Fold freshly normalized evidence into an existing canonical record.
///
/// Provenance is unioned and only ever grows. For text the more complete
/// value wins; for dates, values, and status the newer evidence wins unless
/// it is null — a known non-null field is never replaced by a null.
pub fn merge_evidence(
    existing: &CanonicalRecord,
    incoming: &CanonicalRecord,
    now: DateTime<Utc>,
) -> CanonicalRecord {
    let mut merged = existing.clone();
    for link in &incoming.provenance {
        merged.add_provenance(link.clone());
    }

    merged.title = prefer_longer(&existing.title, &incoming.title);
    merged.description = prefer_longer(&existing.description, &incoming.description);
    if merged.agency.is_empty() {
        merged.agency = incoming.agency.clone();
    }
    merged.posted_date = incoming.posted_date.or(existing.posted_date);
    merged.due_date = incoming.due_date.or(existing.due_date);
    if incoming.estimated_value.is_some() {
        merged.estimated_value = incoming.estimated_value;
        merged.currency = incoming.currency.clone();
    }
    if incoming.status != OpportunityStatus::Unknown {
        merged.status = incoming.status;
    }
    merged.updated_at = now;
    merged
}
