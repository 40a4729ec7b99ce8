//! Run fingerprints: a fixed-dimension numeric feature vector plus a sparse
//! token-weight summary.

pub mod extractor;
pub mod stats;
pub mod tokenizer;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{RepolensError, RepolensResult};

/// Version of the feature vector layout. Bump whenever a component is added,
/// removed or reordered.
pub const FEATURE_SCHEMA_VERSION: u32 = 1;

/// Languages with a dedicated LOC-share slot, in vector order.
pub const TRACKED_LANGUAGES: &[&str] = &[
    "python",
    "javascript",
    "typescript",
    "java",
    "c_cpp",
    "go",
    "rust",
    "ruby",
    "php",
    "web",
];

pub const IDX_LOG_LOC: usize = 0;
pub const IDX_COMPLEXITY: usize = 1;
pub const IDX_MAINTAINABILITY: usize = 2;
pub const IDX_COMMENT_RATIO: usize = 3;
pub const IDX_LANGUAGES: usize = 4;
pub const IDX_OTHER_LANGUAGE: usize = IDX_LANGUAGES + TRACKED_LANGUAGES.len();
pub const IDX_ISSUE_DENSITY: usize = IDX_OTHER_LANGUAGE + 1;

/// Vector dimension for [`FEATURE_SCHEMA_VERSION`].
pub const FEATURE_DIMENSION: usize = IDX_ISSUE_DENSITY + 1;

/// Immutable fingerprint of one analysis run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub schema_version: u32,
    pub vector: Vec<f64>,
    pub tokens: BTreeMap<String, f64>,
}

impl Fingerprint {
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }

    /// Little-endian f64 encoding used for persistence.
    pub fn vector_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    pub fn checksum(&self) -> u32 {
        crc32fast::hash(&self.vector_bytes())
    }

    /// Decode a persisted vector, verifying its length and checksum.
    pub fn decode_vector(bytes: &[u8], expected_checksum: u32) -> RepolensResult<Vec<f64>> {
        if bytes.len() % 8 != 0 {
            return Err(RepolensError::Storage(format!(
                "fingerprint vector has {} bytes, not a multiple of 8",
                bytes.len()
            )));
        }
        let actual = crc32fast::hash(bytes);
        if actual != expected_checksum {
            return Err(RepolensError::Storage(format!(
                "fingerprint checksum mismatch: stored {expected_checksum:#010x}, computed {actual:#010x}"
            )));
        }
        Ok(bytes
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                f64::from_le_bytes(buf)
            })
            .collect())
    }

    /// Compatible with the current schema: right version and dimension.
    pub fn is_current(&self) -> bool {
        self.schema_version == FEATURE_SCHEMA_VERSION && self.dimension() == FEATURE_DIMENSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimension_layout() {
        assert_eq!(IDX_OTHER_LANGUAGE, 14);
        assert_eq!(FEATURE_DIMENSION, 16);
    }

    #[test]
    fn vector_bytes_decode_with_checksum() {
        let fp = Fingerprint {
            schema_version: FEATURE_SCHEMA_VERSION,
            vector: vec![1.5, -2.0, 0.0],
            tokens: BTreeMap::new(),
        };
        let bytes = fp.vector_bytes();
        let decoded = Fingerprint::decode_vector(&bytes, fp.checksum()).unwrap();
        assert_eq!(decoded, fp.vector);
    }

    #[test]
    fn corrupted_vector_is_rejected() {
        let fp = Fingerprint {
            schema_version: FEATURE_SCHEMA_VERSION,
            vector: vec![1.0, 2.0],
            tokens: BTreeMap::new(),
        };
        let mut bytes = fp.vector_bytes();
        bytes[3] ^= 0xFF;
        assert!(Fingerprint::decode_vector(&bytes, fp.checksum()).is_err());
        assert!(Fingerprint::decode_vector(&bytes[..5], fp.checksum()).is_err());
    }
}
