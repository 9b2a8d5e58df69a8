//! Category classification over normalized opportunity text.
//!
//! The runtime contract is text in, `(category, confidence)` out. The model
//! is a set of per-category term prototypes compared by cosine similarity;
//! training better prototypes happens elsewhere. With no usable model the
//! stage degrades to `(unknown, 0.0)` instead of failing the pipeline.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use bidwatch_core::OpportunityCategory;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::text::{cosine, term_vector};

/// Seed prototypes for bootstrapping before a curated model exists.
const SEED_PROTOTYPES: &[(&str, OpportunityCategory)] = &[
    ("Road construction bridge repair highway paving", OpportunityCategory::Construction),
    ("Building renovation roofing plumbing electrical", OpportunityCategory::Construction),
    ("IT software development cloud migration cybersecurity", OpportunityCategory::ItServices),
    ("Network infrastructure server maintenance helpdesk", OpportunityCategory::ItServices),
    ("Legal advisory audit financial accounting", OpportunityCategory::ProfessionalServices),
    ("Management consulting strategic planning", OpportunityCategory::Consulting),
    ("Office supplies furniture equipment purchase", OpportunityCategory::Supplies),
    ("Medical equipment hospital supplies pharmaceuticals", OpportunityCategory::Healthcare),
    ("Fleet management vehicle maintenance transit bus", OpportunityCategory::Transportation),
    ("HVAC elevator janitorial facility maintenance", OpportunityCategory::Maintenance),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryPrototype {
    pub category: OpportunityCategory,
    pub seed_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierModel {
    pub prototypes: Vec<CategoryPrototype>,
}

impl ClassifierModel {
    pub fn seed() -> Self {
        Self {
            prototypes: SEED_PROTOTYPES
                .iter()
                .map(|(text, category)| CategoryPrototype {
                    category: *category,
                    seed_text: text.to_string(),
                })
                .collect(),
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating model directory {}", parent.display()))?;
        }
        let bytes = serde_json::to_vec_pretty(self).context("serializing classifier model")?;
        std::fs::write(path, bytes)
            .with_context(|| format!("writing classifier model {}", path.display()))?;
        Ok(())
    }
}

pub struct CategoryClassifier {
    prototypes: Option<Vec<(OpportunityCategory, HashMap<String, f64>)>>,
}

impl CategoryClassifier {
    pub fn from_model(model: ClassifierModel) -> Self {
        let prototypes = model
            .prototypes
            .into_iter()
            .map(|p| (p.category, term_vector(&p.seed_text)))
            .collect();
        Self {
            prototypes: Some(prototypes),
        }
    }

    pub fn seeded() -> Self {
        Self::from_model(ClassifierModel::seed())
    }

    /// Classifier with no model at all; everything answers `(unknown, 0.0)`.
    pub fn disabled() -> Self {
        Self { prototypes: None }
    }

    /// With no configured path the built-in seed prototypes apply. A
    /// configured path that cannot be read or parsed disables the stage
    /// rather than failing the pipeline.
    pub fn load(model_path: Option<&Path>) -> Self {
        let Some(path) = model_path else {
            return Self::seeded();
        };
        let parsed = std::fs::read_to_string(path)
            .map_err(anyhow::Error::from)
            .and_then(|text| serde_json::from_str::<ClassifierModel>(&text).map_err(Into::into));
        match parsed {
            Ok(model) => {
                info!(path = %path.display(), "classifier model loaded");
                Self::from_model(model)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "classifier model unavailable, degrading to unknown");
                Self::disabled()
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.prototypes.is_some()
    }

    /// Best-matching category and a relative confidence in `[0, 1]`.
    pub fn predict(&self, text: &str) -> (OpportunityCategory, f64) {
        let Some(prototypes) = &self.prototypes else {
            return (OpportunityCategory::Unknown, 0.0);
        };
        let vector = term_vector(text);
        if vector.is_empty() {
            return (OpportunityCategory::Other, 0.0);
        }

        let mut best = (OpportunityCategory::Other, 0.0f64);
        let mut total = 0.0f64;
        for (category, prototype) in prototypes {
            let score = cosine(&vector, prototype);
            total += score;
            if score > best.1 {
                best = (*category, score);
            }
        }
        if best.1 <= 0.0 {
            return (OpportunityCategory::Other, 0.0);
        }
        (best.0, best.1 / total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn seeded_classifier_recognizes_construction() {
        let classifier = CategoryClassifier::seeded();
        let (category, confidence) = classifier.predict("highway bridge construction paving");
        assert_eq!(category, OpportunityCategory::Construction);
        assert!(confidence > 0.2);
    }

    #[test]
    fn seeded_classifier_recognizes_it_services() {
        let classifier = CategoryClassifier::seeded();
        let (category, _) = classifier.predict("cloud migration cybersecurity software project");
        assert_eq!(category, OpportunityCategory::ItServices);
    }

    #[test]
    fn no_signal_answers_other_with_zero_confidence() {
        let classifier = CategoryClassifier::seeded();
        assert_eq!(classifier.predict(""), (OpportunityCategory::Other, 0.0));
        assert_eq!(
            classifier.predict("zzyzx qwerty"),
            (OpportunityCategory::Other, 0.0)
        );
    }

    #[test]
    fn disabled_classifier_degrades_to_unknown() {
        let classifier = CategoryClassifier::disabled();
        assert!(!classifier.is_available());
        assert_eq!(
            classifier.predict("highway bridge construction"),
            (OpportunityCategory::Unknown, 0.0)
        );
    }

    #[test]
    fn unreadable_model_path_disables_the_stage() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let classifier = CategoryClassifier::load(Some(&missing));
        assert!(!classifier.is_available());

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "not json").unwrap();
        let classifier = CategoryClassifier::load(Some(&corrupt));
        assert!(!classifier.is_available());
    }

    #[test]
    fn saved_model_round_trips_through_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("models/classifier.json");
        ClassifierModel::seed().save(&path).unwrap();
        let classifier = CategoryClassifier::load(Some(&path));
        assert!(classifier.is_available());
        let (category, _) = classifier.predict("janitorial facility maintenance hvac");
        assert_eq!(category, OpportunityCategory::Maintenance);
    }
}
