//! Similarity-based record linkage across sources.
//!
//! A new record merges into an existing canonical record only when its
//! term-vector cosine clears the threshold AND the cheap structural signals
//! (agency, due-date window, value ratio) agree. The threshold is policy,
//! not truth — it is configuration, tuned empirically.

use std::cmp::Ordering;

use bidwatch_core::CanonicalRecord;
use strsim::jaro_winkler;
use uuid::Uuid;

use crate::text::{cosine, term_vector, tokenize};

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Minimum cosine similarity before a merge is considered.
    pub similarity_threshold: f64,
    /// Scores within this band count as tied; ties go to the candidate with
    /// more corroborating provenance.
    pub tie_tolerance: f64,
    /// Non-identical agencies still agree above this Jaro-Winkler score.
    pub agency_similarity_floor: f64,
    /// Due dates further apart than this disagree.
    pub due_date_window_days: i64,
    /// Estimated values whose ratio exceeds this disagree.
    pub value_ratio_limit: f64,
    /// Records with fewer salient tokens than this never enter linkage.
    pub min_salient_tokens: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.70,
            tie_tolerance: 0.02,
            agency_similarity_floor: 0.85,
            due_date_window_days: 14,
            value_ratio_limit: 4.0,
            min_salient_tokens: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkMatch {
    pub record_id: Uuid,
    pub score: f64,
    pub provenance_links: usize,
}

pub struct Deduper {
    config: DedupConfig,
}

impl Deduper {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Too little text to compare safely; such records always land as new.
    pub fn is_near_empty(&self, record: &CanonicalRecord) -> bool {
        tokenize(&record.salient_text()).len() < self.config.min_salient_tokens
    }

    /// The canonical record `candidate` should merge into, if any.
    pub fn link_target(
        &self,
        candidate: &CanonicalRecord,
        existing: &[CanonicalRecord],
    ) -> Option<LinkMatch> {
        if self.is_near_empty(candidate) {
            return None;
        }
        let vector = term_vector(&candidate.salient_text());

        let mut matches: Vec<LinkMatch> = existing
            .iter()
            .filter(|other| other.record_id != candidate.record_id)
            .filter(|other| !self.is_near_empty(other))
            .filter_map(|other| {
                let score = cosine(&vector, &term_vector(&other.salient_text()));
                if score >= self.config.similarity_threshold
                    && self.structures_agree(candidate, other)
                {
                    Some(LinkMatch {
                        record_id: other.record_id,
                        score,
                        provenance_links: other.provenance.len(),
                    })
                } else {
                    None
                }
            })
            .collect();
        if matches.is_empty() {
            return None;
        }

        let top = matches.iter().map(|m| m.score).fold(f64::MIN, f64::max);
        matches.retain(|m| top - m.score <= self.config.tie_tolerance);
        matches.sort_by(|a, b| {
            b.provenance_links
                .cmp(&a.provenance_links)
                .then(b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
        });
        matches.into_iter().next()
    }

    fn structures_agree(&self, a: &CanonicalRecord, b: &CanonicalRecord) -> bool {
        if !a.agency.is_empty() && !b.agency.is_empty() {
            let same = a.agency == b.agency
                || jaro_winkler(&a.agency, &b.agency) >= self.config.agency_similarity_floor;
            if !same {
                return false;
            }
        }
        if let (Some(da), Some(db)) = (a.due_date, b.due_date) {
            if (da - db).num_days().abs() > self.config.due_date_window_days {
                return false;
            }
        }
        if let (Some(va), Some(vb)) = (a.estimated_value, b.estimated_value) {
            if va > 0.0 && vb > 0.0 && va.max(vb) / va.min(vb) > self.config.value_ratio_limit {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidwatch_core::Provenance;
    use chrono::{NaiveDate, Utc};

    fn record(source: &str, id: &str, title: &str, agency: &str) -> CanonicalRecord {
        let mut rec = CanonicalRecord::new(Provenance::new(source, id), Utc::now());
        rec.title = title.to_string();
        rec.agency = agency.to_string();
        rec
    }

    #[test]
    fn cross_source_near_duplicates_link() {
        let deduper = Deduper::new(DedupConfig::default());
        let mut a = record(
            "portal_a",
            "A-1",
            "Road Resurfacing Contract",
            "department of transportation",
        );
        a.due_date = NaiveDate::from_ymd_opt(2024, 6, 1);
        let mut b = record(
            "portal_b",
            "B-77",
            "Road Resurfacing - City Contract",
            "department of transportation",
        );
        b.due_date = NaiveDate::from_ymd_opt(2024, 6, 1);

        let link = deduper.link_target(&b, &[a.clone()]).unwrap();
        assert_eq!(link.record_id, a.record_id);
        assert!(link.score >= 0.70);
    }

    #[test]
    fn unrelated_records_never_link() {
        let deduper = Deduper::new(DedupConfig::default());
        let a = record(
            "portal_a",
            "A-1",
            "Road repair on Highway 101",
            "department of transportation",
        );
        let b = record(
            "portal_b",
            "B-2",
            "IT cloud migration project",
            "general services administration",
        );
        assert!(deduper.link_target(&b, &[a]).is_none());
    }

    #[test]
    fn agency_disagreement_blocks_a_textual_match() {
        let deduper = Deduper::new(DedupConfig::default());
        let title = "Citywide Janitorial Cleaning Services FY2025 Contract";
        let a = record("portal_a", "A-1", title, "parks");
        let b = record("portal_b", "B-2", title, "water");
        assert!(deduper.link_target(&b, &[a.clone()]).is_none());

        // Same text with agreeing agencies links fine.
        let c = record("portal_c", "C-3", title, "parks");
        assert!(deduper.link_target(&c, &[a]).is_some());
    }

    #[test]
    fn far_apart_due_dates_block_a_match() {
        let deduper = Deduper::new(DedupConfig::default());
        let mut a = record("portal_a", "A-1", "Snow Removal Services Contract", "public works");
        a.due_date = NaiveDate::from_ymd_opt(2024, 1, 15);
        let mut b = record("portal_b", "B-2", "Snow Removal Services Contract", "public works");
        b.due_date = NaiveDate::from_ymd_opt(2024, 9, 15);
        assert!(deduper.link_target(&b, &[a]).is_none());
    }

    #[test]
    fn wildly_different_values_block_a_match() {
        let deduper = Deduper::new(DedupConfig::default());
        let mut a = record("portal_a", "A-1", "Fleet Vehicle Maintenance Services", "transit");
        a.estimated_value = Some(10_000.0);
        let mut b = record("portal_b", "B-2", "Fleet Vehicle Maintenance Services", "transit");
        b.estimated_value = Some(900_000.0);
        assert!(deduper.link_target(&b, &[a]).is_none());
    }

    #[test]
    fn near_empty_records_are_excluded_from_linkage() {
        let deduper = Deduper::new(DedupConfig::default());
        let a = record("portal_a", "A-1", "", "");
        let b = record("portal_b", "B-2", "", "");
        assert!(deduper.is_near_empty(&b));
        assert!(deduper.link_target(&b, &[a]).is_none());
    }

    #[test]
    fn ties_prefer_more_corroborated_candidates() {
        let deduper = Deduper::new(DedupConfig::default());
        let lone = record("portal_a", "A-1", "City Hall Roof Replacement Project", "public works");
        let mut corroborated = record(
            "portal_b",
            "B-1",
            "City Hall Roof Replacement Project",
            "public works",
        );
        corroborated.add_provenance(Provenance::new("portal_c", "C-9"));

        let candidate = record("portal_d", "D-1", "City Hall Roof Replacement Project", "public works");
        let link = deduper
            .link_target(&candidate, &[lone, corroborated.clone()])
            .unwrap();
        assert_eq!(link.record_id, corroborated.record_id);
        assert_eq!(link.provenance_links, 2);
    }
}
