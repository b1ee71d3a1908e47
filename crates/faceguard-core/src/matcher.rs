//! Nearest-neighbour classification over enrolled descriptors.

use crate::descriptor::Descriptor;
use crate::types::{Identity, MatchLabel, MatchResult};

struct LabeledSamples {
    label: String,
    samples: Vec<Descriptor>,
}

/// Classifier built from a snapshot of the identity gallery.
///
/// Holds its own copy of the descriptors and never touches the store; a new
/// matcher is built whenever the gallery or the threshold changes.
pub struct FaceMatcher {
    entries: Vec<LabeledSamples>,
    threshold: f32,
}

impl FaceMatcher {
    /// Build a matcher, or `None` when nothing is enrolled.
    ///
    /// Entries are ordered by label so that exact distance ties resolve to
    /// the label that sorts first, independent of store ordering.
    pub fn rebuild(identities: &[Identity], threshold: f32) -> Option<Self> {
        let mut entries: Vec<LabeledSamples> = identities
            .iter()
            .filter(|identity| !identity.descriptors.is_empty())
            .map(|identity| LabeledSamples {
                label: identity.label.clone(),
                samples: identity.descriptors.clone(),
            })
            .collect();

        if entries.is_empty() {
            return None;
        }
        entries.sort_by(|a, b| a.label.cmp(&b.label));

        tracing::debug!(
            identities = entries.len(),
            samples = entries.iter().map(|e| e.samples.len()).sum::<usize>(),
            threshold,
            "face matcher rebuilt"
        );

        Some(Self { entries, threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Labels known to this matcher, in tie-break order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    /// Classify a query descriptor against every enrolled sample.
    pub fn classify(&self, query: &Descriptor) -> MatchResult {
        let mut best_distance = f32::INFINITY;
        let mut best_label: Option<&str> = None;

        for entry in &self.entries {
            for sample in &entry.samples {
                let distance = query.distance(sample);
                // Strict comparison keeps the earlier label on exact ties.
                if distance < best_distance {
                    best_distance = distance;
                    best_label = Some(&entry.label);
                }
            }
        }

        match best_label {
            Some(label) if best_distance <= self.threshold => MatchResult {
                label: MatchLabel::Known(label.to_string()),
                distance: best_distance,
            },
            _ => MatchResult {
                label: MatchLabel::Unknown,
                distance: best_distance,
            },
        }
    }
}
