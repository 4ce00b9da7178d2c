//! Exercise catalog: presentation details and key-moment phases.
//!
//! The classifier emits compound `<pose>_<phase>` labels. For every pose the
//! catalog names the phase that counts as a completed repetition.

use crate::types::ExerciseDetails;
use once_cell::sync::Lazy;
use std::collections::HashMap;

/// Built-in key moments, built once and reused across sessions
static DEFAULT_KEY_MOMENTS: Lazy<HashMap<String, String>> = Lazy::new(|| {
    [
        ("star", "up"),
        ("squat", "down"),
        ("lunge", "down"),
        ("pushup", "down"),
        ("crunch", "up"),
        ("jumping_jack", "open"),
        ("high_knees", "up"),
        ("burpee", "up"),
        ("plank_jack", "open"),
        ("side_bend", "down"),
    ]
    .into_iter()
    .map(|(pose, phase)| (pose.to_string(), phase.to_string()))
    .collect()
});

/// Get a reference to the built-in key-moment table
pub fn default_key_moments() -> &'static HashMap<String, String> {
    &DEFAULT_KEY_MOMENTS
}

/// Exercise dictionary for one session
#[derive(Clone, Debug, Default)]
pub struct ExerciseCatalog {
    details: HashMap<String, ExerciseDetails>,
    key_moments: HashMap<String, String>,
}

impl ExerciseCatalog {
    /// Catalog with the built-in key moments and no presentation details
    pub fn new() -> Self {
        Self {
            details: HashMap::new(),
            key_moments: default_key_moments().clone(),
        }
    }

    /// Merge configured key moments over the current table
    pub fn with_key_moments(mut self, overrides: &HashMap<String, String>) -> Self {
        for (pose, phase) in overrides {
            self.key_moments.insert(pose.clone(), phase.clone());
        }
        self
    }

    /// Replace the presentation details with the service dictionary
    pub fn set_details(&mut self, details: HashMap<String, ExerciseDetails>) {
        tracing::debug!("Loaded {} exercise descriptions", details.len());
        self.details = details;
    }

    pub fn details(&self, label: &str) -> Option<&ExerciseDetails> {
        self.details.get(label)
    }

    pub fn key_moments(&self) -> &HashMap<String, String> {
        &self.key_moments
    }

    /// Labels in `pipeline_labels` the debouncer could never count
    pub fn validate<'a>(&self, pipeline_labels: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut missing: Vec<String> = pipeline_labels
            .into_iter()
            .filter(|label| !self.key_moments.contains_key(*label))
            .map(|label| format!("No key moment configured for exercise '{}'", label))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}
