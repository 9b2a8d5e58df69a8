//! Normalize → classify → deduplicate → upsert, per pending batch.

use std::sync::Arc;

use bidwatch_core::RawRecord;
use bidwatch_storage::{RecordStore, StoreError};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::classify::CategoryClassifier;
use crate::dedup::Deduper;
use crate::normalize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineSummary {
    pub processed: usize,
    pub created: usize,
    pub merged: usize,
    pub refreshed: usize,
    pub skipped_empty: usize,
    pub failed: usize,
}

enum Outcome {
    Created,
    CreatedEmpty,
    Merged,
    Refreshed,
}

/// Consumes raw records (never mutates them) and converges the canonical
/// store. Safe to re-run: already-linked provenance refreshes in place and
/// unchanged content never reaches the pending set in the first place.
pub struct ProcessingPipeline {
    store: Arc<RecordStore>,
    classifier: CategoryClassifier,
    deduper: Deduper,
}

impl ProcessingPipeline {
    pub fn new(store: Arc<RecordStore>, classifier: CategoryClassifier, deduper: Deduper) -> Self {
        Self {
            store,
            classifier,
            deduper,
        }
    }

    pub async fn run(&self) -> Result<PipelineSummary, StoreError> {
        let pending = self.store.take_pending().await;
        info!(batch = pending.len(), "pipeline started");

        let mut summary = PipelineSummary::default();
        let mut drained = Vec::with_capacity(pending.len());
        for raw in pending {
            let key = (raw.source_name.clone(), raw.source_id.clone());
            match self.process_one(&raw).await {
                Ok(outcome) => {
                    summary.processed += 1;
                    match outcome {
                        Outcome::Created => summary.created += 1,
                        Outcome::CreatedEmpty => {
                            summary.created += 1;
                            summary.skipped_empty += 1;
                        }
                        Outcome::Merged => summary.merged += 1,
                        Outcome::Refreshed => summary.refreshed += 1,
                    }
                }
                Err(err) => {
                    warn!(source = %key.0, id = %key.1, error = %err, "item failed canonicalization");
                    summary.failed += 1;
                }
            }
            drained.push(key);
        }
        self.store.clear_pending(&drained).await?;

        info!(
            processed = summary.processed,
            created = summary.created,
            merged = summary.merged,
            refreshed = summary.refreshed,
            failed = summary.failed,
            "pipeline finished"
        );
        Ok(summary)
    }

    async fn process_one(&self, raw: &RawRecord) -> Result<Outcome, StoreError> {
        let now = Utc::now();
        let mut incoming = normalize::normalize(raw, now);
        let (category, confidence) = self
            .classifier
            .predict(&format!("{} {}", incoming.title, incoming.description));
        incoming.category = category;
        incoming.category_confidence = confidence;

        // Known provenance: later evidence for the same item refreshes its
        // canonical record in place rather than spawning a competitor.
        if let Some(existing) = self
            .store
            .canonical_by_provenance(&raw.source_name, &raw.source_id)
            .await
        {
            let merged = self.reclassified_merge(&existing, &incoming);
            self.store.upsert_canonical(merged).await?;
            return Ok(Outcome::Refreshed);
        }

        if self.deduper.is_near_empty(&incoming) {
            // Not enough text to compare against anything; flag and keep.
            incoming.category_confidence = 0.0;
            self.store.upsert_canonical(incoming).await?;
            return Ok(Outcome::CreatedEmpty);
        }

        let existing = self.store.all_canonical().await;
        if let Some(link) = self.deduper.link_target(&incoming, &existing) {
            if let Some(target) = self.store.get_canonical(link.record_id).await {
                let merged = self.reclassified_merge(&target, &incoming);
                self.store.upsert_canonical(merged).await?;
                return Ok(Outcome::Merged);
            }
        }

        self.store.upsert_canonical(incoming).await?;
        Ok(Outcome::Created)
    }

    /// Merge evidence, then re-run classification over the merged text so
    /// the category reflects the union of what every source said.
    fn reclassified_merge(
        &self,
        existing: &bidwatch_core::CanonicalRecord,
        incoming: &bidwatch_core::CanonicalRecord,
    ) -> bidwatch_core::CanonicalRecord {
        let mut merged = normalize::merge_evidence(existing, incoming, Utc::now());
        let (category, confidence) = self
            .classifier
            .predict(&format!("{} {}", merged.title, merged.description));
        merged.category = category;
        merged.category_confidence = confidence;
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::DedupConfig;
    use bidwatch_core::{OpportunityCategory, RawRecord};
    use bidwatch_storage::UpsertOutcome;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn raw(source: &str, id: &str, fields: &[(&str, &str)]) -> RawRecord {
        let extracted: BTreeMap<String, String> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RawRecord::new(
            source,
            id,
            format!("https://{source}.example/{id}"),
            Utc::now(),
            extracted,
        )
    }

    fn pipeline(store: Arc<RecordStore>) -> ProcessingPipeline {
        ProcessingPipeline::new(
            store,
            CategoryClassifier::seeded(),
            Deduper::new(DedupConfig::default()),
        )
    }

    #[tokio::test]
    async fn cross_source_duplicates_merge_into_one_record() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path()).await.unwrap());
        store
            .upsert_raw(raw(
                "portal_a",
                "A-1",
                &[
                    ("title", "Road Resurfacing Contract"),
                    ("agency", "DOT"),
                    ("due_date", "2024-06-01"),
                ],
            ))
            .await
            .unwrap();
        store
            .upsert_raw(raw(
                "portal_b",
                "B-77",
                &[
                    ("title", "Road Resurfacing - City DOT"),
                    ("agency", "DOT"),
                    ("due_date", "2024-06-01"),
                ],
            ))
            .await
            .unwrap();

        let summary = pipeline(store.clone()).run().await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.merged, 1);

        let records = store.all_canonical().await;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.provenance.len(), 2);
        let mut sources: Vec<(&str, &str)> = record
            .provenance
            .iter()
            .map(|p| (p.source_name.as_str(), p.source_id.as_str()))
            .collect();
        sources.sort();
        assert_eq!(sources, vec![("portal_a", "A-1"), ("portal_b", "B-77")]);
    }

    #[tokio::test]
    async fn unrelated_records_stay_separate() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path()).await.unwrap());
        store
            .upsert_raw(raw(
                "portal_a",
                "A-1",
                &[
                    ("title", "Road repair on Highway 101"),
                    ("agency", "Dept of Transportation"),
                ],
            ))
            .await
            .unwrap();
        store
            .upsert_raw(raw(
                "portal_b",
                "B-2",
                &[
                    ("title", "IT cloud migration project"),
                    ("agency", "General Services Admin"),
                ],
            ))
            .await
            .unwrap();

        pipeline(store.clone()).run().await.unwrap();
        assert_eq!(store.all_canonical().await.len(), 2);
    }

    #[tokio::test]
    async fn identical_reruns_create_nothing_new() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path()).await.unwrap());
        let record = raw(
            "portal_a",
            "A-1",
            &[("title", "Bridge Painting Services"), ("agency", "DOT")],
        );
        store.upsert_raw(record.clone()).await.unwrap();
        pipeline(store.clone()).run().await.unwrap();
        assert_eq!(store.all_canonical().await.len(), 1);

        // Second collection of identical content: no new raw row, an empty
        // pending set, and an unchanged canonical count.
        let outcome = store.upsert_raw(record).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Unchanged);
        let summary = pipeline(store.clone()).run().await.unwrap();
        assert_eq!(summary.processed, 0);
        assert_eq!(store.all_canonical().await.len(), 1);
        assert_eq!(store.raw_history("portal_a", "A-1").await.len(), 1);
    }

    #[tokio::test]
    async fn changed_content_refreshes_in_place() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path()).await.unwrap());
        store
            .upsert_raw(raw(
                "portal_a",
                "A-1",
                &[("title", "Bridge Painting Services"), ("agency", "DOT")],
            ))
            .await
            .unwrap();
        pipeline(store.clone()).run().await.unwrap();

        store
            .upsert_raw(raw(
                "portal_a",
                "A-1",
                &[
                    ("title", "Bridge Painting Services"),
                    ("agency", "DOT"),
                    ("status", "awarded"),
                ],
            ))
            .await
            .unwrap();
        let summary = pipeline(store.clone()).run().await.unwrap();
        assert_eq!(summary.refreshed, 1);

        let records = store.all_canonical().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, bidwatch_core::OpportunityStatus::Awarded);
        assert_eq!(records[0].provenance.len(), 1);
    }

    #[tokio::test]
    async fn missing_classifier_still_completes_the_pipeline() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path()).await.unwrap());
        store
            .upsert_raw(raw(
                "portal_a",
                "A-1",
                &[("title", "Highway bridge construction paving"), ("agency", "DOT")],
            ))
            .await
            .unwrap();

        let pipeline = ProcessingPipeline::new(
            store.clone(),
            CategoryClassifier::disabled(),
            Deduper::new(DedupConfig::default()),
        );
        let summary = pipeline.run().await.unwrap();
        assert_eq!(summary.processed, 1);

        let records = store.all_canonical().await;
        assert_eq!(records[0].category, OpportunityCategory::Unknown);
        assert_eq!(records[0].category_confidence, 0.0);
    }

    #[tokio::test]
    async fn near_empty_records_always_land_as_new() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path()).await.unwrap());
        store
            .upsert_raw(raw("portal_a", "A-1", &[("due_date", "2024-06-01")]))
            .await
            .unwrap();
        store
            .upsert_raw(raw("portal_b", "B-1", &[("due_date", "2024-06-01")]))
            .await
            .unwrap();

        let summary = pipeline(store.clone()).run().await.unwrap();
        assert_eq!(summary.skipped_empty, 2);

        let records = store.all_canonical().await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.category_confidence == 0.0));
    }

    #[tokio::test]
    async fn merged_records_keep_the_most_complete_fields() {
        let dir = tempdir().unwrap();
        let store = Arc::new(RecordStore::open(dir.path()).await.unwrap());
        store
            .upsert_raw(raw(
                "portal_a",
                "A-1",
                &[
                    ("title", "County Courthouse Roof Replacement"),
                    ("agency", "Dept of Public Works"),
                    ("due_date", "2024-07-15"),
                    ("estimated_value", "$450,000"),
                ],
            ))
            .await
            .unwrap();
        store
            .upsert_raw(raw(
                "portal_b",
                "B-9",
                &[
                    ("title", "County Courthouse Roof Replacement Project"),
                    ("agency", "Department of Public Works"),
                    ("due_date", "2024-07-15"),
                    ("description", "Tear-off and replacement of the courthouse roof"),
                ],
            ))
            .await
            .unwrap();

        pipeline(store.clone()).run().await.unwrap();
        let records = store.all_canonical().await;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.estimated_value, Some(450_000.0));
        assert!(record.description.contains("courthouse roof"));
        assert_eq!(record.provenance.len(), 2);
    }
}
