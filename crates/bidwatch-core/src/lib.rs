//! Core record model and provenance types shared across the collector.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-core";

/// Lifecycle status of a contracting opportunity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    Active,
    Closed,
    Awarded,
    Cancelled,
    #[default]
    Unknown,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Awarded => "awarded",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            "awarded" => Some(Self::Awarded),
            "cancelled" => Some(Self::Cancelled),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Procurement category assigned by the classifier.
///
/// `Unknown` is reserved for the degraded path where no classifier model is
/// available at all; a loaded model that finds no signal answers `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityCategory {
    Construction,
    ItServices,
    ProfessionalServices,
    Supplies,
    Consulting,
    Healthcare,
    Transportation,
    Maintenance,
    Other,
    #[default]
    Unknown,
}

impl OpportunityCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Construction => "construction",
            Self::ItServices => "it_services",
            Self::ProfessionalServices => "professional_services",
            Self::Supplies => "supplies",
            Self::Consulting => "consulting",
            Self::Healthcare => "healthcare",
            Self::Transportation => "transportation",
            Self::Maintenance => "maintenance",
            Self::Other => "other",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "construction" => Some(Self::Construction),
            "it_services" => Some(Self::ItServices),
            "professional_services" => Some(Self::ProfessionalServices),
            "supplies" => Some(Self::Supplies),
            "consulting" => Some(Self::Consulting),
            "healthcare" => Some(Self::Healthcare),
            "transportation" => Some(Self::Transportation),
            "maintenance" => Some(Self::Maintenance),
            "other" => Some(Self::Other),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// One `(source, native id)` link backing a canonical record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Provenance {
    pub source_name: String,
    pub source_id: String,
}

impl Provenance {
    pub fn new(source_name: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            source_id: source_id.into(),
        }
    }
}

/// One attempted extraction from one source at one point in time.
///
/// `extracted` is an open per-source mapping; a `BTreeMap` keeps its
/// serialization order deterministic so the content hash is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    pub source_name: String,
    pub source_id: String,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub extracted: BTreeMap<String, String>,
    pub content_hash: String,
    pub version: u32,
}

impl RawRecord {
    /// Build a version-1 record with its content hash derived from `extracted`.
    pub fn new(
        source_name: impl Into<String>,
        source_id: impl Into<String>,
        source_url: impl Into<String>,
        fetched_at: DateTime<Utc>,
        extracted: BTreeMap<String, String>,
    ) -> Self {
        let content_hash = content_hash_of(&extracted);
        Self {
            source_name: source_name.into(),
            source_id: source_id.into(),
            source_url: source_url.into(),
            fetched_at,
            extracted,
            content_hash,
            version: 1,
        }
    }

    pub fn provenance(&self) -> Provenance {
        Provenance::new(self.source_name.clone(), self.source_id.clone())
    }
}

/// SHA-256 hex digest over the canonical JSON serialization of an extracted
/// payload. `BTreeMap` iteration order makes the serialization deterministic.
pub fn content_hash_of(extracted: &BTreeMap<String, String>) -> String {
    let payload = serde_json::to_vec(extracted).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&payload);
    hex::encode(hasher.finalize())
}

/// One deduplicated, cross-source opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub record_id: Uuid,
    pub provenance: Vec<Provenance>,
    pub title: String,
    pub description: String,
    pub agency: String,
    pub posted_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub estimated_value: Option<f64>,
    pub currency: String,
    pub status: OpportunityStatus,
    pub category: OpportunityCategory,
    pub category_confidence: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalRecord {
    /// A fresh single-provenance record with unknown classification.
    pub fn new(provenance: Provenance, created_at: DateTime<Utc>) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            provenance: vec![provenance],
            title: String::new(),
            description: String::new(),
            agency: String::new(),
            posted_date: None,
            due_date: None,
            estimated_value: None,
            currency: "USD".to_string(),
            status: OpportunityStatus::Unknown,
            category: OpportunityCategory::Unknown,
            category_confidence: 0.0,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn has_provenance(&self, link: &Provenance) -> bool {
        self.provenance.iter().any(|p| p == link)
    }

    /// Append a provenance link if not already present. The set only grows.
    pub fn add_provenance(&mut self, link: Provenance) {
        if !self.has_provenance(&link) {
            self.provenance.push(link);
        }
    }

    /// Text used for similarity linkage and classification.
    pub fn salient_text(&self) -> String {
        let mut text = String::new();
        for part in [&self.title, &self.agency, &self.description] {
            if !part.is_empty() {
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(part);
            }
        }
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extracted(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn content_hash_is_stable_for_same_payload() {
        let a = extracted(&[("title", "Test Opportunity"), ("agency", "Test Agency")]);
        let b = extracted(&[("agency", "Test Agency"), ("title", "Test Opportunity")]);
        assert_eq!(content_hash_of(&a), content_hash_of(&b));
        assert_eq!(content_hash_of(&a).len(), 64);
    }

    #[test]
    fn content_hash_changes_with_payload() {
        let a = extracted(&[("title", "A")]);
        let b = extracted(&[("title", "B")]);
        assert_ne!(content_hash_of(&a), content_hash_of(&b));
    }

    #[test]
    fn raw_record_derives_hash_and_starts_at_version_one() {
        let rec = RawRecord::new(
            "test_source",
            "123",
            "https://example.com/123",
            Utc::now(),
            extracted(&[("title", "Test")]),
        );
        assert_eq!(rec.version, 1);
        assert_eq!(rec.content_hash, content_hash_of(&rec.extracted));
    }

    #[test]
    fn provenance_set_only_grows() {
        let mut rec = CanonicalRecord::new(Provenance::new("a", "1"), Utc::now());
        rec.add_provenance(Provenance::new("b", "2"));
        rec.add_provenance(Provenance::new("a", "1"));
        assert_eq!(rec.provenance.len(), 2);
    }

    #[test]
    fn status_and_category_round_trip_through_names() {
        for status in [
            OpportunityStatus::Active,
            OpportunityStatus::Closed,
            OpportunityStatus::Awarded,
            OpportunityStatus::Cancelled,
            OpportunityStatus::Unknown,
        ] {
            assert_eq!(OpportunityStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(
            OpportunityCategory::parse("it_services"),
            Some(OpportunityCategory::ItServices)
        );
        assert_eq!(OpportunityCategory::parse("nope"), None);
    }
}
