//! Validated 128-dimension embeddings and their byte codec.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dimensionality of the embeddings produced by the recognition model.
pub const DESCRIPTOR_DIM: usize = 128;
const DESCRIPTOR_BYTE_LEN: usize = DESCRIPTOR_DIM * 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("invalid descriptor dimension: {0} (expected 128)")]
    InvalidDimension(usize),
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidValue,
    #[error("invalid descriptor blob size: {0} bytes")]
    InvalidBlob(usize),
}

/// A face embedding with exactly [`DESCRIPTOR_DIM`] finite values.
///
/// Construction always goes through validation, so a `Descriptor` held
/// anywhere in the workspace satisfies the identity invariants. Serializes
/// as a plain JSON array of numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Descriptor(Vec<f32>);

impl Descriptor {
    pub fn values(&self) -> &[f32] {
        &self.0
    }

    /// Euclidean distance between two descriptors. Lower = more similar.
    pub fn distance(&self, other: &Descriptor) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian `f32` encoding used by the database backend.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(DESCRIPTOR_BYTE_LEN);
        for &v in &self.0 {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    /// Decode a blob produced by [`to_bytes`](Self::to_bytes), rejecting
    /// wrong lengths and non-finite values.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DescriptorError> {
        if bytes.len() != DESCRIPTOR_BYTE_LEN {
            return Err(DescriptorError::InvalidBlob(bytes.len()));
        }
        let values = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect::<Vec<_>>();
        Self::try_from(values)
    }
}

impl TryFrom<Vec<f32>> for Descriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        validate(&values)?;
        Ok(Self(values))
    }
}

impl From<Descriptor> for Vec<f32> {
    fn from(descriptor: Descriptor) -> Self {
        descriptor.0
    }
}

/// True when `values` could be stored as a descriptor.
pub fn is_valid_descriptor(values: &[f32]) -> bool {
    validate(values).is_ok()
}

fn validate(values: &[f32]) -> Result<(), DescriptorError> {
    if values.len() != DESCRIPTOR_DIM {
        return Err(DescriptorError::InvalidDimension(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(DescriptorError::InvalidValue);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp() -> Vec<f32> {
        (0..DESCRIPTOR_DIM).map(|i| i as f32 / DESCRIPTOR_DIM as f32).collect()
    }

    #[test]
    fn test_accepts_valid_values() {
        assert!(is_valid_descriptor(&ramp()));
        assert!(Descriptor::try_from(ramp()).is_ok());
    }

    #[test]
    fn test_rejects_wrong_dimension() {
        let err = Descriptor::try_from(vec![0.5f32; 512]).unwrap_err();
        assert_eq!(err, DescriptorError::InvalidDimension(512));
        assert!(!is_valid_descriptor(&[]));
    }

    #[test]
    fn test_rejects_nan_and_infinity() {
        let mut values = ramp();
        values[17] = f32::NAN;
        assert_eq!(Descriptor::try_from(values).unwrap_err(), DescriptorError::InvalidValue);

        let mut values = ramp();
        values[0] = f32::NEG_INFINITY;
        assert!(!is_valid_descriptor(&values));
    }

    #[test]
    fn test_byte_fidelity() {
        let mut values = vec![0.25f32; DESCRIPTOR_DIM];
        values[0] = -0.0;
        values[1] = f32::MIN_POSITIVE;
        values[2] = std::f32::consts::PI;
        values[3] = -1.0;
        let descriptor = Descriptor::try_from(values.clone()).unwrap();

        let recovered = Descriptor::from_bytes(&descriptor.to_bytes()).unwrap();
        for (orig, rec) in values.iter().zip(recovered.values()) {
            assert_eq!(orig.to_bits(), rec.to_bits(), "mismatch: {orig} vs {rec}");
        }
    }

    #[test]
    fn test_from_bytes_rejects_short_blob() {
        let err = Descriptor::from_bytes(&[0u8; 100]).unwrap_err();
        assert_eq!(err, DescriptorError::InvalidBlob(100));
    }

    #[test]
    fn test_distance() {
        let a = Descriptor::try_from(vec![0.0f32; DESCRIPTOR_DIM]).unwrap();
        let mut shifted = vec![0.0f32; DESCRIPTOR_DIM];
        shifted[0] = 3.0;
        shifted[1] = 4.0;
        let b = Descriptor::try_from(shifted).unwrap();
        assert!((a.distance(&b) - 5.0).abs() < 1e-6);
        assert_eq!(a.distance(&a), 0.0);
    }

    #[test]
    fn test_deserialize_validates() {
        let json = serde_json::to_string(&vec![0.1f32; 3]).unwrap();
        assert!(serde_json::from_str::<Descriptor>(&json).is_err());

        let json = serde_json::to_string(&ramp()).unwrap();
        let descriptor: Descriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(descriptor.values().len(), DESCRIPTOR_DIM);
    }
}
