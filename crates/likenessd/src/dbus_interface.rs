use std::sync::Arc;

use likeness_core::repository::{DetectionRepository, GalleryRepository, StoreError};
use likeness_core::{DetectionId, IdentityId, OwnerId, PhotoId};
use likeness_store::SqliteStore;
use serde::Serialize;
use tokio::runtime::Handle;
use zbus::interface;

use crate::pipeline::{Pipeline, SubmitError};

pub const BUS_NAME: &str = "org.likeness.Faces1";
pub const OBJECT_PATH: &str = "/org/likeness/Faces1";

/// D-Bus interface for the Likeness face tagging daemon.
///
/// Bus name: org.likeness.Faces1
/// Object path: /org/likeness/Faces1
///
/// Structured results are returned as JSON strings.
pub struct LikenessService {
    store: Arc<SqliteStore>,
    pipeline: Pipeline,
    runtime: Handle,
    model_path: String,
}

impl LikenessService {
    /// Must be called from within the tokio runtime that owns the pipeline.
    pub fn new(store: Arc<SqliteStore>, pipeline: Pipeline, model_path: String) -> Self {
        Self {
            store,
            pipeline,
            runtime: Handle::current(),
            model_path,
        }
    }

    /// Run a store call off the D-Bus executor.
    async fn with_store<T, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        F: FnOnce(&SqliteStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        self.runtime
            .spawn_blocking(move || f(&store))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("worker task failed: {e}")))?
            .map_err(store_error)
    }

    async fn with_pipeline<T, E, F>(&self, f: F) -> zbus::fdo::Result<T>
    where
        F: FnOnce(&Pipeline) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<zbus::fdo::Error> + Send + 'static,
    {
        let pipeline = self.pipeline.clone();
        self.runtime
            .spawn_blocking(move || f(&pipeline).map_err(Into::into))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("worker task failed: {e}")))?
    }

    async fn status_json(&self, photo_id: i64) -> zbus::fdo::Result<String> {
        let status = self
            .with_pipeline(move |pipeline| pipeline.status(PhotoId(photo_id)).map_err(store_error))
            .await?;
        to_json(&status)
    }
}

#[interface(name = "org.likeness.Faces1")]
impl LikenessService {
    /// Register a photo for an owner. Returns the new photo id.
    async fn register_photo(&self, owner_id: i64, storage_path: &str) -> zbus::fdo::Result<i64> {
        tracing::info!(owner_id, storage_path, "register_photo requested");
        let path = storage_path.to_string();
        let photo = self
            .with_store(move |store| store.register_photo(OwnerId(owner_id), &path))
            .await?;
        Ok(photo.id.0)
    }

    /// Start detection and matching for a photo. Returns the initial job state.
    async fn submit(&self, photo_id: i64) -> zbus::fdo::Result<String> {
        tracing::info!(photo_id, "submit requested");
        let handle = self
            .with_pipeline(move |pipeline| pipeline.submit(PhotoId(photo_id)))
            .await?;
        // Completion is observed through Status; the task runs detached.
        drop(handle);
        self.status_json(photo_id).await
    }

    /// Job state of a photo as `{"state": ..., "error": ...}`.
    async fn status(&self, photo_id: i64) -> zbus::fdo::Result<String> {
        self.status_json(photo_id).await
    }

    /// Promote a detection to a new identity. An empty name leaves it unnamed.
    async fn create_identity(&self, detection_id: i64, name: &str) -> zbus::fdo::Result<i64> {
        tracing::info!(detection_id, "create_identity requested");
        let name = non_empty(name);
        let identity = self
            .with_pipeline(move |pipeline| {
                pipeline
                    .create_identity(DetectionId(detection_id), name.as_deref())
                    .map_err(store_error)
            })
            .await?;
        Ok(identity.0)
    }

    async fn rename_identity(&self, identity_id: i64, name: &str) -> zbus::fdo::Result<()> {
        tracing::info!(identity_id, "rename_identity requested");
        let name = non_empty(name);
        self.with_store(move |store| store.rename_identity(IdentityId(identity_id), name.as_deref()))
            .await
    }

    /// Exclude an identity from future matching. Existing links are kept.
    async fn deactivate_identity(&self, identity_id: i64) -> zbus::fdo::Result<()> {
        tracing::info!(identity_id, "deactivate_identity requested");
        self.with_store(move |store| store.deactivate_identity(IdentityId(identity_id)))
            .await
    }

    async fn list_photos(&self, owner_id: i64) -> zbus::fdo::Result<String> {
        let photos = self
            .with_store(move |store| store.list_photos(OwnerId(owner_id)))
            .await?;
        to_json(&photos)
    }

    async fn list_detections(&self, photo_id: i64) -> zbus::fdo::Result<String> {
        let detections = self
            .with_store(move |store| store.detections_for_photo(PhotoId(photo_id)))
            .await?;
        to_json(&detections)
    }

    async fn list_identities(&self, owner_id: i64) -> zbus::fdo::Result<String> {
        let identities = self
            .with_store(move |store| store.list_identities(OwnerId(owner_id)))
            .await?;
        to_json(&identities)
    }

    /// Photos containing at least one detection linked to the identity.
    async fn identity_photos(&self, identity_id: i64) -> zbus::fdo::Result<String> {
        let photos = self
            .with_store(move |store| store.photos_for_identity(IdentityId(identity_id)))
            .await?;
        to_json(&photos)
    }

    /// Return daemon status information.
    async fn daemon_status(&self) -> zbus::fdo::Result<String> {
        let config = self.pipeline.config();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "model": self.model_path,
            "similarity_threshold": config.matcher.similarity_threshold,
            "distance_normalization": config.matcher.distance_normalization,
            "max_concurrent_jobs": config.max_concurrent_jobs,
            "jobs_in_flight": self.pipeline.jobs_in_flight(),
        })
        .to_string())
    }
}

fn non_empty(name: &str) -> Option<String> {
    let trimmed = name.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(format!("serialization failed: {e}")))
}

fn store_error(err: StoreError) -> zbus::fdo::Error {
    match err {
        StoreError::NotFound(_) | StoreError::InactiveIdentity(_) => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        StoreError::Conflict(_) | StoreError::Backend(_) => zbus::fdo::Error::Failed(err.to_string()),
    }
}

impl From<SubmitError> for zbus::fdo::Error {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::Store(e) => store_error(e),
            SubmitError::PhotoNotFound(_) => zbus::fdo::Error::InvalidArgs(err.to_string()),
            SubmitError::AlreadyProcessed(_) | SubmitError::AlreadyInFlight(_) => {
                zbus::fdo::Error::Failed(err.to_string())
            }
        }
    }
}
