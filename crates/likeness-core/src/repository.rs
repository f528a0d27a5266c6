//! Interfaces to the collaborators the pipeline reads from and writes to.
//!
//! Everything crosses these traits as owned value objects keyed by opaque
//! ids; no implementation hands out live references into its storage.

use crate::descriptor::{Descriptor, DescriptorError};
use crate::matcher::GalleryEntry;
use crate::types::{BoundingBox, Detection, DetectionId, Identity, IdentityId, OwnerId, Photo, PhotoId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    /// A transient write race; the same write may succeed if retried.
    #[error("write conflict: {0}")]
    Conflict(String),
    #[error("identity {0} is not active")]
    InactiveIdentity(IdentityId),
    #[error("storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Error, Debug)]
pub enum ImageAccessError {
    #[error("image for photo {0} not found")]
    NotFound(PhotoId),
    #[error("image for photo {photo} unreadable: {reason}")]
    Unreadable { photo: PhotoId, reason: String },
}

/// Fields of a detection at creation time.
#[derive(Debug, Clone)]
pub struct NewDetection<'a> {
    pub bbox: BoundingBox,
    pub descriptor: &'a Descriptor,
}

/// A gallery reference descriptor exactly as stored, not yet decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct GalleryRecord {
    pub identity: IdentityId,
    pub descriptor: Vec<u8>,
}

/// An owner's active gallery as of one point in time.
///
/// Decoding happens once; a corrupt record poisons the whole snapshot so that
/// matching against it fails per detection instead of silently shrinking the
/// gallery.
#[derive(Debug, Clone)]
pub struct GallerySnapshot {
    pub owner: OwnerId,
    entries: Result<Vec<GalleryEntry>, (IdentityId, DescriptorError)>,
}

impl GallerySnapshot {
    pub fn from_records(owner: OwnerId, records: Vec<GalleryRecord>) -> Self {
        let entries = records
            .into_iter()
            .map(|r| {
                Descriptor::decode(&r.descriptor)
                    .map(|descriptor| GalleryEntry { identity: r.identity, descriptor })
                    .map_err(|e| (r.identity, e))
            })
            .collect();
        Self { owner, entries }
    }

    pub fn entries(&self) -> Result<&[GalleryEntry], &(IdentityId, DescriptorError)> {
        self.entries.as_deref()
    }
}

/// Reads images for photos.
pub trait ImageSource: Send + Sync {
    fn read_image(&self, photo: PhotoId) -> Result<Vec<u8>, ImageAccessError>;
}

/// The slice of photo management the pipeline needs.
pub trait PhotoRepository: Send + Sync {
    fn photo(&self, photo: PhotoId) -> Result<Option<Photo>, StoreError>;
    fn mark_processed(&self, photo: PhotoId) -> Result<(), StoreError>;
}

/// Persistent face detections.
pub trait DetectionRepository: Send + Sync {
    /// One atomic write per detection.
    fn persist_detection(&self, photo: PhotoId, detection: &NewDetection<'_>) -> Result<DetectionId, StoreError>;

    /// Link a detection to an active identity and mark it identified.
    /// A detection that is already linked is left as it is.
    fn attach_identity(&self, detection: DetectionId, identity: IdentityId) -> Result<(), StoreError>;

    fn detections_for_photo(&self, photo: PhotoId) -> Result<Vec<Detection>, StoreError>;
}

/// Per-owner identities and their reference descriptors.
pub trait GalleryRepository: Send + Sync {
    /// Reference descriptors of the owner's active identities.
    fn gallery_snapshot(&self, owner: OwnerId) -> Result<Vec<GalleryRecord>, StoreError>;

    /// Create an identity from a detection's stored descriptor and link the
    /// detection to it.
    fn promote_detection(&self, detection: DetectionId, name: Option<&str>) -> Result<IdentityId, StoreError>;

    fn rename_identity(&self, identity: IdentityId, name: Option<&str>) -> Result<(), StoreError>;

    /// Exclude from future snapshots. Existing detection links are kept.
    fn deactivate_identity(&self, identity: IdentityId) -> Result<(), StoreError>;

    fn list_identities(&self, owner: OwnerId) -> Result<Vec<Identity>, StoreError>;

    /// Distinct photos containing at least one detection linked to the identity.
    fn photos_for_identity(&self, identity: IdentityId) -> Result<Vec<PhotoId>, StoreError>;
}
