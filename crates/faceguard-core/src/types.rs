use serde::{Deserialize, Serialize};

use crate::descriptor::Descriptor;

/// Version written into every export envelope.
pub const STORAGE_VERSION: u32 = 1;

/// Axis-aligned face box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// One face located in a single frame. Lives for one detection pass.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: FaceBox,
    /// Detector confidence, display only.
    pub score: f32,
    pub landmarks: Vec<(f32, f32)>,
    pub descriptor: Descriptor,
    /// Age, gender and expression estimates, when the engine provides them.
    pub attributes: Option<FaceAttributes>,
}

/// Auxiliary per-face estimates. Shown on the overlay, never matched on.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FaceAttributes {
    /// Estimated age in years.
    pub age: f32,
    pub gender: String,
    pub gender_probability: f32,
    /// Expression name and probability, in engine order.
    pub expressions: Vec<(String, f32)>,
}

impl FaceAttributes {
    /// Most probable expression; the first one listed wins a tie.
    pub fn top_expression(&self) -> Option<(&str, f32)> {
        self.expressions
            .iter()
            .fold(None, |best: Option<&(String, f32)>, candidate| match best {
                Some(b) if b.1 >= candidate.1 => Some(b),
                _ => Some(candidate),
            })
            .map(|(name, p)| (name.as_str(), *p))
    }
}

/// A named person with one descriptor per enrollment sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub label: String,
    /// Enrollment order is preserved.
    pub descriptors: Vec<Descriptor>,
    /// Milliseconds since the Unix epoch, set at first enrollment.
    pub created_at: i64,
}

impl Identity {
    pub fn new(label: impl Into<String>, created_at: i64) -> Self {
        Self {
            label: label.into(),
            descriptors: Vec::new(),
            created_at,
        }
    }

    pub fn sample_count(&self) -> usize {
        self.descriptors.len()
    }
}

/// Export/import envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageData {
    pub users: Vec<Identity>,
    pub version: u32,
}

impl StorageData {
    pub fn new(users: Vec<Identity>) -> Self {
        Self {
            users,
            version: STORAGE_VERSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchLabel {
    Known(String),
    Unknown,
}

/// Outcome of classifying one descriptor against the enrolled gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub label: MatchLabel,
    /// Distance to the nearest enrolled sample.
    pub distance: f32,
}

impl MatchResult {
    pub fn is_known(&self) -> bool {
        matches!(self.label, MatchLabel::Known(_))
    }
}
