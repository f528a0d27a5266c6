//! Gallery matching.
//!
//! Similarity is derived from Euclidean distance as
//! `1 - min(distance / D, 1)`, so it always lies in `[0, 1]`.

use crate::descriptor::Descriptor;
use crate::types::IdentityId;
use thiserror::Error;

/// Default distance normalization constant `D`.
pub const DEFAULT_DISTANCE_NORMALIZATION: f32 = 100.0;
/// Default minimum similarity for an accepted match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum MatchError {
    #[error("descriptor length mismatch for identity {identity}: probe has {probe}, gallery has {gallery}")]
    DimensionMismatch {
        identity: IdentityId,
        probe: usize,
        gallery: usize,
    },
}

/// One reference descriptor of an active identity.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryEntry {
    pub identity: IdentityId,
    pub descriptor: Descriptor,
}

/// A ranked gallery candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub identity: IdentityId,
    pub similarity: f32,
}

/// Outcome of matching one probe against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Best candidate, whether or not it cleared the threshold.
    pub best: Option<Candidate>,
}

impl MatchResult {
    /// Identity to record on the detection, if the match was accepted.
    pub fn identity(&self) -> Option<IdentityId> {
        if self.matched {
            self.best.map(|c| c.identity)
        } else {
            None
        }
    }
}

/// Matcher tuning. Descriptors compared with different settings are not
/// comparable, so this travels with the matcher instead of living globally.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatcherConfig {
    pub distance_normalization: f32,
    pub similarity_threshold: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            distance_normalization: DEFAULT_DISTANCE_NORMALIZATION,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

/// Strategy for comparing a probe descriptor against a gallery.
pub trait Matcher {
    /// Score every gallery entry, best first. Equal scores keep gallery order.
    fn rank(&self, probe: &Descriptor, gallery: &[GalleryEntry]) -> Result<Vec<Candidate>, MatchError>;

    /// Whether a similarity clears the acceptance threshold (inclusive).
    fn accepts(&self, similarity: f32) -> bool;

    fn compare(&self, probe: &Descriptor, gallery: &[GalleryEntry]) -> Result<MatchResult, MatchError> {
        let best = self.rank(probe, gallery)?.into_iter().next();
        Ok(MatchResult {
            matched: best.is_some_and(|c| self.accepts(c.similarity)),
            best,
        })
    }
}

/// Euclidean-distance matcher. Holds no mutable state.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher {
    config: MatcherConfig,
}

impl EuclideanMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Map a distance onto `[0, 1]`.
    pub fn similarity(&self, distance: f32) -> f32 {
        1.0 - (distance / self.config.distance_normalization).min(1.0)
    }
}

impl Matcher for EuclideanMatcher {
    fn rank(&self, probe: &Descriptor, gallery: &[GalleryEntry]) -> Result<Vec<Candidate>, MatchError> {
        let mut ranked = gallery
            .iter()
            .map(|entry| {
                if entry.descriptor.len() != probe.len() {
                    return Err(MatchError::DimensionMismatch {
                        identity: entry.identity,
                        probe: probe.len(),
                        gallery: entry.descriptor.len(),
                    });
                }
                let distance = probe.euclidean_distance(&entry.descriptor);
                Ok(Candidate {
                    identity: entry.identity,
                    similarity: self.similarity(distance),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        // sort_by is stable: ties stay in gallery order.
        ranked.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(ranked)
    }

    fn accepts(&self, similarity: f32) -> bool {
        similarity >= self.config.similarity_threshold
    }
}
