//! likeness-store: SQLite storage for photos, detections, and identities.
//!
//! Implements every collaborator trait the pipeline consumes, plus the
//! image-access collaborator (reading a photo's storage path from disk).

pub mod schema;
mod store;

pub use store::SqliteStore;
