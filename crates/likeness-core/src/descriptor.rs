//! Face descriptors and their storage encoding.
//!
//! A descriptor is only comparable to descriptors produced by the same
//! extraction configuration. The production configuration is fixed:
//! crops are resized to [`DESCRIPTOR_SIDE`]×[`DESCRIPTOR_SIDE`] luma pixels and
//! each pixel is scaled to `[0, 1]`, giving [`DESCRIPTOR_LEN`] values.
//!
//! Stored layout, version 1:
//!
//! ```text
//! "LKD" | version: u8 | len: u32 LE | len × f32 LE
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Side length, in pixels, of the square crop a descriptor is computed from.
pub const DESCRIPTOR_SIDE: u32 = 100;
/// Number of values in a descriptor produced by the pixel extractor.
pub const DESCRIPTOR_LEN: usize = (DESCRIPTOR_SIDE * DESCRIPTOR_SIDE) as usize;
/// Current storage encoding version.
pub const DESCRIPTOR_FORMAT_VERSION: u8 = 1;

const MAGIC: &[u8; 3] = b"LKD";
const HEADER_LEN: usize = MAGIC.len() + 1 + 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("descriptor is empty")]
    Empty,
    #[error("descriptor value at index {index} is not finite")]
    NonFinite { index: usize },
    #[error("stored descriptor is truncated ({0} bytes)")]
    Truncated(usize),
    #[error("stored descriptor has bad magic")]
    BadMagic,
    #[error("unsupported descriptor format version {0}")]
    UnsupportedVersion(u8),
    #[error("stored descriptor declares {declared} values but carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// Fixed-length face feature vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    values: Vec<f32>,
}

impl Descriptor {
    /// Wrap raw values. Rejects empty vectors and NaN/infinite entries.
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.is_empty() {
            return Err(DescriptorError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance. Callers must check that lengths agree.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Serialize to the versioned storage layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.values.len() * 4);
        out.extend_from_slice(MAGIC);
        out.push(DESCRIPTOR_FORMAT_VERSION);
        out.extend_from_slice(&(self.values.len() as u32).to_le_bytes());
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Parse the versioned storage layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, DescriptorError> {
        if bytes.len() < HEADER_LEN {
            return Err(DescriptorError::Truncated(bytes.len()));
        }
        if bytes[..MAGIC.len()] != MAGIC[..] {
            return Err(DescriptorError::BadMagic);
        }
        let version = bytes[MAGIC.len()];
        if version != DESCRIPTOR_FORMAT_VERSION {
            return Err(DescriptorError::UnsupportedVersion(version));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[MAGIC.len() + 1..HEADER_LEN]);
        let declared = u32::from_le_bytes(len_bytes) as usize;

        let payload = &bytes[HEADER_LEN..];
        if payload.len() % 4 != 0 || payload.len() / 4 != declared {
            return Err(DescriptorError::LengthMismatch {
                declared,
                actual: payload.len() / 4,
            });
        }

        let values = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(values)
    }
}
