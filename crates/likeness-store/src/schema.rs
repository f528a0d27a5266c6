use rusqlite::Connection;

/// Bumped whenever the table layout changes.
pub const SCHEMA_VERSION: i32 = 1;

pub fn initialize(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS photos (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id        INTEGER NOT NULL,
            storage_path    TEXT NOT NULL,
            processed       INTEGER NOT NULL DEFAULT 0,
            registered_at   TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_photos_owner ON photos(owner_id);

        CREATE TABLE IF NOT EXISTS identities (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id    INTEGER NOT NULL,
            name        TEXT,
            active      INTEGER NOT NULL DEFAULT 1,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_identities_owner_active ON identities(owner_id, active);

        CREATE TABLE IF NOT EXISTS detections (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            photo_id    INTEGER NOT NULL REFERENCES photos(id) ON DELETE CASCADE,
            x           REAL NOT NULL,
            y           REAL NOT NULL,
            width       REAL NOT NULL,
            height      REAL NOT NULL,
            confidence  REAL NOT NULL,
            descriptor  BLOB NOT NULL,
            identity_id INTEGER REFERENCES identities(id) ON DELETE SET NULL,
            identified  INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_detections_photo ON detections(photo_id);
        CREATE INDEX IF NOT EXISTS idx_detections_identity ON detections(identity_id);

        CREATE TABLE IF NOT EXISTS identity_descriptors (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            identity_id         INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
            source_detection_id INTEGER REFERENCES detections(id) ON DELETE SET NULL,
            descriptor          BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_identity_descriptors_identity ON identity_descriptors(identity_id);

        CREATE TRIGGER IF NOT EXISTS detections_descriptor_immutable
        BEFORE UPDATE OF descriptor ON detections
        BEGIN
            SELECT RAISE(ABORT, 'descriptors are immutable');
        END;

        CREATE TRIGGER IF NOT EXISTS identity_descriptors_immutable
        BEFORE UPDATE OF descriptor ON identity_descriptors
        BEGIN
            SELECT RAISE(ABORT, 'descriptors are immutable');
        END;
        ",
    )?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}
