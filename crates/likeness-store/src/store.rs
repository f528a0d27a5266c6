use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use likeness_core::repository::{
    DetectionRepository, GalleryRecord, GalleryRepository, ImageAccessError, ImageSource,
    NewDetection, PhotoRepository, StoreError,
};
use likeness_core::{BoundingBox, Detection, DetectionId, Identity, IdentityId, OwnerId, Photo, PhotoId};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::schema;

const BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// SQLite-backed photos, detections, and identity gallery.
///
/// One connection behind a mutex; every public operation is a single
/// statement or a single transaction.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path with WAL mode.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(Box::new(e)))?;
        }
        let conn = Connection::open(path).map_err(db_error)?;
        conn.pragma_update(None, "journal_mode", "WAL").map_err(db_error)?;
        Self::with_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory().map_err(db_error)?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_error)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(db_error)?;
        schema::initialize(&conn).map_err(db_error)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Photos ───────────────────────────────────────────────────────

    /// Record a photo owned by `owner` whose image lives at `storage_path`.
    pub fn register_photo(&self, owner: OwnerId, storage_path: &str) -> Result<Photo, StoreError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO photos (owner_id, storage_path, processed, registered_at) VALUES (?1, ?2, 0, ?3)",
            params![owner.0, storage_path, Utc::now().to_rfc3339()],
        )
        .map_err(db_error)?;
        let id = PhotoId(conn.last_insert_rowid());
        tracing::debug!(photo_id = %id, owner = %owner, "photo registered");
        Ok(Photo {
            id,
            owner,
            storage_path: storage_path.to_string(),
            processed: false,
        })
    }

    pub fn list_photos(&self, owner: OwnerId) -> Result<Vec<Photo>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, owner_id, storage_path, processed FROM photos WHERE owner_id = ?1 ORDER BY id")
            .map_err(db_error)?;
        let photos = stmt
            .query_map(params![owner.0], photo_from_row)
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        Ok(photos)
    }
}

impl PhotoRepository for SqliteStore {
    fn photo(&self, photo: PhotoId) -> Result<Option<Photo>, StoreError> {
        self.conn()
            .query_row(
                "SELECT id, owner_id, storage_path, processed FROM photos WHERE id = ?1",
                params![photo.0],
                photo_from_row,
            )
            .optional()
            .map_err(db_error)
    }

    fn mark_processed(&self, photo: PhotoId) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute("UPDATE photos SET processed = 1 WHERE id = ?1", params![photo.0])
            .map_err(db_error)?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("photo {photo}")));
        }
        Ok(())
    }
}

impl DetectionRepository for SqliteStore {
    fn persist_detection(&self, photo: PhotoId, detection: &NewDetection<'_>) -> Result<DetectionId, StoreError> {
        let conn = self.conn();
        let b = &detection.bbox;
        conn.execute(
            "INSERT INTO detections (photo_id, x, y, width, height, confidence, descriptor, identified)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                photo.0,
                b.x as f64,
                b.y as f64,
                b.width as f64,
                b.height as f64,
                b.confidence as f64,
                detection.descriptor.encode(),
            ],
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => StoreError::NotFound(format!("photo {photo}")),
            _ => db_error(e),
        })?;
        Ok(DetectionId(conn.last_insert_rowid()))
    }

    fn attach_identity(&self, detection: DetectionId, identity: IdentityId) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_error)?;

        let active: Option<bool> = tx
            .query_row("SELECT active FROM identities WHERE id = ?1", params![identity.0], |row| row.get(0))
            .optional()
            .map_err(db_error)?;
        match active {
            None => return Err(StoreError::NotFound(format!("identity {identity}"))),
            Some(false) => return Err(StoreError::InactiveIdentity(identity)),
            Some(true) => {}
        }

        let changed = tx
            .execute(
                "UPDATE detections SET identity_id = ?2, identified = 1 WHERE id = ?1 AND identity_id IS NULL",
                params![detection.0, identity.0],
            )
            .map_err(db_error)?;

        if changed == 0 {
            let exists: bool = tx
                .query_row("SELECT EXISTS(SELECT 1 FROM detections WHERE id = ?1)", params![detection.0], |row| {
                    row.get(0)
                })
                .map_err(db_error)?;
            if !exists {
                return Err(StoreError::NotFound(format!("detection {detection}")));
            }
            tracing::debug!(detection_id = %detection, identity_id = %identity, "detection already linked; left unchanged");
        }

        tx.commit().map_err(db_error)
    }

    fn detections_for_photo(&self, photo: PhotoId) -> Result<Vec<Detection>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, photo_id, x, y, width, height, confidence, identity_id, identified
                 FROM detections WHERE photo_id = ?1 ORDER BY id",
            )
            .map_err(db_error)?;
        let detections = stmt
            .query_map(params![photo.0], detection_from_row)
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        Ok(detections)
    }
}

impl GalleryRepository for SqliteStore {
    fn gallery_snapshot(&self, owner: OwnerId) -> Result<Vec<GalleryRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT d.identity_id, d.descriptor
                 FROM identity_descriptors d
                 JOIN identities i ON i.id = d.identity_id
                 WHERE i.owner_id = ?1 AND i.active = 1
                 ORDER BY i.id, d.id",
            )
            .map_err(db_error)?;
        let records = stmt
            .query_map(params![owner.0], |row| {
                Ok(GalleryRecord {
                    identity: IdentityId(row.get(0)?),
                    descriptor: row.get(1)?,
                })
            })
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        Ok(records)
    }

    fn promote_detection(&self, detection: DetectionId, name: Option<&str>) -> Result<IdentityId, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(db_error)?;

        let owner: i64 = tx
            .query_row(
                "SELECT p.owner_id FROM detections d JOIN photos p ON p.id = d.photo_id WHERE d.id = ?1",
                params![detection.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_error)?
            .ok_or_else(|| StoreError::NotFound(format!("detection {detection}")))?;

        tx.execute(
            "INSERT INTO identities (owner_id, name, active, created_at) VALUES (?1, ?2, 1, ?3)",
            params![owner, name, Utc::now().to_rfc3339()],
        )
        .map_err(db_error)?;
        let identity = IdentityId(tx.last_insert_rowid());

        // The blob is copied inside SQLite; it never round-trips through a decode.
        tx.execute(
            "INSERT INTO identity_descriptors (identity_id, source_detection_id, descriptor)
             SELECT ?1, id, descriptor FROM detections WHERE id = ?2",
            params![identity.0, detection.0],
        )
        .map_err(db_error)?;

        tx.execute(
            "UPDATE detections SET identity_id = ?2, identified = 1 WHERE id = ?1",
            params![detection.0, identity.0],
        )
        .map_err(db_error)?;

        tx.commit().map_err(db_error)?;
        tracing::info!(detection_id = %detection, identity_id = %identity, owner, "identity created from detection");
        Ok(identity)
    }

    fn rename_identity(&self, identity: IdentityId, name: Option<&str>) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute("UPDATE identities SET name = ?2 WHERE id = ?1", params![identity.0, name])
            .map_err(db_error)?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("identity {identity}")));
        }
        Ok(())
    }

    fn deactivate_identity(&self, identity: IdentityId) -> Result<(), StoreError> {
        let changed = self
            .conn()
            .execute("UPDATE identities SET active = 0 WHERE id = ?1", params![identity.0])
            .map_err(db_error)?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("identity {identity}")));
        }
        tracing::info!(identity_id = %identity, "identity deactivated");
        Ok(())
    }

    fn list_identities(&self, owner: OwnerId) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT i.id, i.owner_id, i.name, i.active, i.created_at, COUNT(d.id)
                 FROM identities i
                 LEFT JOIN identity_descriptors d ON d.identity_id = i.id
                 WHERE i.owner_id = ?1
                 GROUP BY i.id
                 ORDER BY i.id",
            )
            .map_err(db_error)?;
        let identities = stmt
            .query_map(params![owner.0], |row| {
                Ok(Identity {
                    id: IdentityId(row.get(0)?),
                    owner: OwnerId(row.get(1)?),
                    name: row.get(2)?,
                    active: row.get(3)?,
                    created_at: timestamp(row, 4)?,
                    reference_count: row.get::<_, i64>(5)? as usize,
                })
            })
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        Ok(identities)
    }

    fn photos_for_identity(&self, identity: IdentityId) -> Result<Vec<PhotoId>, StoreError> {
        let conn = self.conn();
        let exists: bool = conn
            .query_row("SELECT EXISTS(SELECT 1 FROM identities WHERE id = ?1)", params![identity.0], |row| {
                row.get(0)
            })
            .map_err(db_error)?;
        if !exists {
            return Err(StoreError::NotFound(format!("identity {identity}")));
        }

        let mut stmt = conn
            .prepare("SELECT DISTINCT photo_id FROM detections WHERE identity_id = ?1 ORDER BY photo_id")
            .map_err(db_error)?;
        let photos = stmt
            .query_map(params![identity.0], |row| Ok(PhotoId(row.get(0)?)))
            .map_err(db_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(db_error)?;
        Ok(photos)
    }
}

impl ImageSource for SqliteStore {
    fn read_image(&self, photo: PhotoId) -> Result<Vec<u8>, ImageAccessError> {
        let record = self.photo(photo).map_err(|e| ImageAccessError::Unreadable {
            photo,
            reason: e.to_string(),
        })?;
        let record = record.ok_or(ImageAccessError::NotFound(photo))?;

        std::fs::read(&record.storage_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ImageAccessError::NotFound(photo),
            _ => ImageAccessError::Unreadable {
                photo,
                reason: format!("{}: {e}", record.storage_path),
            },
        })
    }
}

fn photo_from_row(row: &Row<'_>) -> rusqlite::Result<Photo> {
    Ok(Photo {
        id: PhotoId(row.get(0)?),
        owner: OwnerId(row.get(1)?),
        storage_path: row.get(2)?,
        processed: row.get(3)?,
    })
}

fn detection_from_row(row: &Row<'_>) -> rusqlite::Result<Detection> {
    Ok(Detection {
        id: DetectionId(row.get(0)?),
        photo: PhotoId(row.get(1)?),
        bbox: BoundingBox {
            x: row.get::<_, f64>(2)? as f32,
            y: row.get::<_, f64>(3)? as f32,
            width: row.get::<_, f64>(4)? as f32,
            height: row.get::<_, f64>(5)? as f32,
            confidence: row.get::<_, f64>(6)? as f32,
        },
        identity: row.get::<_, Option<i64>>(7)?.map(IdentityId),
        identified: row.get(8)?,
    })
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

/// Busy/locked databases are transient conflicts; everything else is a backend failure.
fn db_error(err: rusqlite::Error) -> StoreError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => StoreError::Conflict(err.to_string()),
        _ => StoreError::Backend(Box::new(err)),
    }
}
