use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

id_type!(
    /// Opaque key of a stored photo.
    PhotoId
);
id_type!(
    /// Opaque key of a photo owner. Owners live outside this system.
    OwnerId
);
id_type!(
    /// Opaque key of a persisted face detection.
    DetectionId
);
id_type!(
    /// Opaque key of a known identity in an owner's gallery.
    IdentityId
);

/// Bounding box of a located face, in absolute pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Locator score, passed through unchanged.
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// A photo as seen by the pipeline: who owns it and whether it has been processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Photo {
    pub id: PhotoId,
    pub owner: OwnerId,
    pub storage_path: String,
    pub processed: bool,
}

/// A persisted face detection. The descriptor is not carried here; it never
/// leaves storage except through the gallery snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub id: DetectionId,
    pub photo: PhotoId,
    pub bbox: BoundingBox,
    pub identity: Option<IdentityId>,
    pub identified: bool,
}

/// A known person in an owner's gallery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub owner: OwnerId,
    /// Display name. Purely cosmetic; never consulted when matching.
    pub name: Option<String>,
    pub active: bool,
    pub reference_count: usize,
    pub created_at: DateTime<Utc>,
}
