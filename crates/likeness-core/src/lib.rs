//! likeness-core: face descriptors and gallery matching.
//!
//! Locates faces with SCRFD via ONNX Runtime, derives fixed-length pixel
//! descriptors from the face crops, and ranks them against an owner's
//! identity gallery.

pub mod descriptor;
pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod repository;
pub mod types;

pub use descriptor::{Descriptor, DescriptorError};
pub use detector::{FaceLocator, ScrfdDetector};
pub use extractor::{DescriptorExtractor, ExtractError, ExtractedFace, PixelExtractor};
pub use matcher::{Candidate, EuclideanMatcher, GalleryEntry, MatchError, MatchResult, Matcher, MatcherConfig};
pub use types::{BoundingBox, Detection, DetectionId, Identity, IdentityId, OwnerId, Photo, PhotoId};

/// Default directory searched for ONNX model files.
pub fn default_model_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("likeness/models")
}
