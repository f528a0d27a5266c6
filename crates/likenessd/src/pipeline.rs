use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use likeness_core::descriptor::DescriptorError;
use likeness_core::repository::{
    DetectionRepository, GalleryRepository, GallerySnapshot, ImageSource, NewDetection,
    PhotoRepository, StoreError,
};
use likeness_core::{
    DescriptorExtractor, DetectionId, EuclideanMatcher, ExtractedFace, IdentityId, MatchError,
    Matcher, MatcherConfig, Photo, PhotoId,
};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

/// Pause before retry `n` is `n` times this.
const RETRY_BACKOFF: Duration = Duration::from_millis(20);

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("photo {0} not found")]
    PhotoNotFound(PhotoId),
    #[error("photo {0} is already processed")]
    AlreadyProcessed(PhotoId),
    #[error("photo {0} already has a job in flight")]
    AlreadyInFlight(PhotoId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures that end a job in `FAILED`.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("image for photo {photo} unreadable: {reason}")]
    ImageUnreadable { photo: PhotoId, reason: String },
    #[error("write conflict on photo {photo} persisted after {attempts} attempts: {reason}")]
    PersistenceConflict {
        photo: PhotoId,
        attempts: u32,
        reason: String,
    },
    #[error("storage failure on photo {photo}: {source}")]
    Store {
        photo: PhotoId,
        #[source]
        source: StoreError,
    },
    #[error("job for photo {photo} aborted: {reason}")]
    Aborted { photo: PhotoId, reason: String },
}

/// Why a single detection was left unmatched. Never fails the job.
#[derive(Error, Debug)]
enum DetectionMatchFailure {
    #[error("gallery descriptor of identity {identity} is corrupt: {source}")]
    CorruptGallery {
        identity: IdentityId,
        source: DescriptorError,
    },
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("identity {0} was deactivated before the detection could be attached")]
    InactiveIdentity(IdentityId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    New,
    Extracting,
    Matching,
    Persisting,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::New => "NEW",
            JobState::Extracting => "EXTRACTING",
            JobState::Matching => "MATCHING",
            JobState::Persisting => "PERSISTING",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub state: JobState,
    /// Set only for `FAILED`.
    pub error: Option<String>,
}

impl JobStatus {
    fn at(state: JobState) -> Self {
        Self { state, error: None }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            error: Some(reason.into()),
        }
    }
}

/// Outcome of a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub photo: PhotoId,
    pub detections: usize,
    pub identified: usize,
    pub match_failures: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub matcher: MatcherConfig,
    pub max_concurrent_jobs: usize,
    pub extract_timeout: Duration,
    /// Attempts per write, including the first.
    pub write_retries: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            matcher: MatcherConfig::default(),
            max_concurrent_jobs: 4,
            extract_timeout: Duration::from_secs(30),
            write_retries: 3,
        }
    }
}

/// The storage collaborators a pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub images: Arc<dyn ImageSource>,
    pub photos: Arc<dyn PhotoRepository>,
    pub detections: Arc<dyn DetectionRepository>,
    pub gallery: Arc<dyn GalleryRepository>,
}

impl Collaborators {
    /// Use one store for every role.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ImageSource + PhotoRepository + DetectionRepository + GalleryRepository + 'static,
    {
        Self {
            images: store.clone(),
            photos: store.clone(),
            detections: store.clone(),
            gallery: store,
        }
    }
}

/// Await the outcome of a submitted job.
#[derive(Debug)]
pub struct JobHandle {
    photo: PhotoId,
    task: JoinHandle<Result<JobSummary, JobError>>,
}

impl JobHandle {
    pub fn photo(&self) -> PhotoId {
        self.photo
    }

    pub async fn wait(self) -> Result<JobSummary, JobError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(JobError::Aborted {
                photo: self.photo,
                reason: e.to_string(),
            }),
        }
    }
}

/// Clone-safe handle to the detection-and-matching pipeline.
///
/// Each submitted photo runs as its own task. At most one job per photo is
/// in flight and at most `max_concurrent_jobs` execute at once; the rest
/// wait in `NEW`.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

struct Inner {
    stores: Collaborators,
    extractor: Arc<dyn DescriptorExtractor>,
    matcher: EuclideanMatcher,
    config: PipelineConfig,
    permits: Arc<Semaphore>,
    runtime: Handle,
    jobs: Mutex<JobTable>,
}

#[derive(Default)]
struct JobTable {
    in_flight: HashSet<PhotoId>,
    status: HashMap<PhotoId, JobStatus>,
}

impl Pipeline {
    /// Must be called from within a tokio runtime; jobs are spawned onto it.
    pub fn new(
        stores: Collaborators,
        extractor: Arc<dyn DescriptorExtractor>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                stores,
                extractor,
                matcher: EuclideanMatcher::new(config.matcher),
                permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
                runtime: Handle::current(),
                jobs: Mutex::new(JobTable::default()),
                config,
            }),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Start a job for an unprocessed photo.
    ///
    /// Admission is atomic per photo: a second submit while one is in flight
    /// fails with `AlreadyInFlight`, and a submit after completion fails with
    /// `AlreadyProcessed`. Blocks briefly on the photo lookup.
    pub fn submit(&self, photo_id: PhotoId) -> Result<JobHandle, SubmitError> {
        let photo = {
            let mut jobs = self.inner.jobs();
            if jobs.in_flight.contains(&photo_id) {
                return Err(SubmitError::AlreadyInFlight(photo_id));
            }
            let photo = self
                .inner
                .stores
                .photos
                .photo(photo_id)?
                .ok_or(SubmitError::PhotoNotFound(photo_id))?;
            if photo.processed {
                return Err(SubmitError::AlreadyProcessed(photo_id));
            }
            jobs.in_flight.insert(photo_id);
            jobs.status.insert(photo_id, JobStatus::at(JobState::New));
            photo
        };

        let slot = InFlightSlot {
            inner: self.inner.clone(),
            photo: photo_id,
        };
        let inner = self.inner.clone();
        let task = self.inner.runtime.spawn(async move {
            let _slot = slot;
            inner.run(photo).await
        });

        tracing::info!(photo_id = %photo_id, "job submitted");
        Ok(JobHandle {
            photo: photo_id,
            task,
        })
    }

    /// Current state of the photo's most recent job. Photos never submitted
    /// since startup report `DONE` or `NEW` from their processed flag.
    pub fn status(&self, photo_id: PhotoId) -> Result<JobStatus, StoreError> {
        if let Some(status) = self.inner.jobs().status.get(&photo_id) {
            return Ok(status.clone());
        }
        match self.inner.stores.photos.photo(photo_id)? {
            Some(photo) if photo.processed => Ok(JobStatus::at(JobState::Done)),
            Some(_) => Ok(JobStatus::at(JobState::New)),
            None => Err(StoreError::NotFound(format!("photo {photo_id}"))),
        }
    }

    /// Promote a detection to a new identity. Blocking.
    ///
    /// The identity joins the owner's gallery for jobs whose snapshot is
    /// taken afterwards; jobs already past snapshot are unaffected.
    pub fn create_identity(&self, detection: DetectionId, name: Option<&str>) -> Result<IdentityId, StoreError> {
        let gallery = &self.inner.stores.gallery;
        let identity = self
            .inner
            .retrying("promote detection", || gallery.promote_detection(detection, name))?;
        tracing::info!(detection_id = %detection, identity_id = %identity, "identity created");
        Ok(identity)
    }

    pub fn jobs_in_flight(&self) -> usize {
        self.inner.jobs().in_flight.len()
    }
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, JobTable> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, photo: PhotoId, state: JobState) {
        tracing::debug!(photo_id = %photo, %state, "job state");
        self.jobs().status.insert(photo, JobStatus::at(state));
    }

    async fn run(self: Arc<Self>, photo: Photo) -> Result<JobSummary, JobError> {
        let result = self.execute(&photo).await;
        match &result {
            Ok(summary) => {
                self.set_state(photo.id, JobState::Done);
                tracing::info!(
                    photo_id = %photo.id,
                    detections = summary.detections,
                    identified = summary.identified,
                    match_failures = summary.match_failures,
                    "job done"
                );
            }
            Err(err) => {
                self.jobs().status.insert(photo.id, JobStatus::failed(err.to_string()));
                tracing::error!(photo_id = %photo.id, error = %err, "job failed");
            }
        }
        result
    }

    async fn execute(self: &Arc<Self>, photo: &Photo) -> Result<JobSummary, JobError> {
        let photo_id = photo.id;
        let permit = self.permits.clone().acquire_owned().await.map_err(|e| JobError::Aborted {
            photo: photo_id,
            reason: e.to_string(),
        })?;
        self.set_state(photo_id, JobState::Extracting);

        let owner = photo.owner;
        let gallery = self.stores.gallery.clone();
        let records = self
            .blocking(photo_id, move || gallery.gallery_snapshot(owner))
            .await?
            .map_err(|source| JobError::Store { photo: photo_id, source })?;
        let snapshot = GallerySnapshot::from_records(owner, records);

        let images = self.stores.images.clone();
        let image = self
            .blocking(photo_id, move || images.read_image(photo_id))
            .await?
            .map_err(|e| JobError::ImageUnreadable {
                photo: photo_id,
                reason: e.to_string(),
            })?;

        // The permit travels with the extraction call so a timed-out call
        // keeps its slot until it actually returns.
        let extractor = self.extractor.clone();
        let extraction = self
            .runtime
            .spawn_blocking(move || (extractor.extract(&image), permit));
        let outcome = tokio::time::timeout(self.config.extract_timeout, extraction).await;
        let (extracted, _permit): (_, OwnedSemaphorePermit) = match outcome {
            Err(_) => {
                return Err(JobError::ImageUnreadable {
                    photo: photo_id,
                    reason: format!("extraction timed out after {:?}", self.config.extract_timeout),
                })
            }
            Ok(Err(join)) => {
                return Err(JobError::Aborted {
                    photo: photo_id,
                    reason: join.to_string(),
                })
            }
            Ok(Ok(extracted)) => extracted,
        };
        let faces = extracted.map_err(|e| JobError::ImageUnreadable {
            photo: photo_id,
            reason: e.to_string(),
        })?;
        tracing::info!(photo_id = %photo_id, faces = faces.len(), "faces extracted");

        let summary = if faces.is_empty() {
            JobSummary {
                photo: photo_id,
                detections: 0,
                identified: 0,
                match_failures: 0,
            }
        } else {
            self.set_state(photo_id, JobState::Matching);
            let inner = self.clone();
            self.blocking(photo_id, move || inner.persist_faces(photo_id, &faces, &snapshot))
                .await??
        };

        self.set_state(photo_id, JobState::Persisting);
        let inner = self.clone();
        self.blocking(photo_id, move || {
            inner
                .retrying("mark processed", || inner.stores.photos.mark_processed(photo_id))
                .map_err(|e| job_store_error(photo_id, inner.config.write_retries, e))
        })
        .await??;

        Ok(summary)
    }

    async fn blocking<T, F>(&self, photo: PhotoId, f: F) -> Result<T, JobError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.runtime.spawn_blocking(f).await.map_err(|e| JobError::Aborted {
            photo,
            reason: e.to_string(),
        })
    }

    /// Persist every face and match it against the snapshot. A face whose
    /// match fails stays unidentified; only storage failures end the job,
    /// and detections already written are kept.
    fn persist_faces(
        &self,
        photo: PhotoId,
        faces: &[ExtractedFace],
        snapshot: &GallerySnapshot,
    ) -> Result<JobSummary, JobError> {
        let mut summary = JobSummary {
            photo,
            detections: 0,
            identified: 0,
            match_failures: 0,
        };

        for face in faces {
            let new = NewDetection {
                bbox: face.bbox,
                descriptor: &face.descriptor,
            };
            let detection = self
                .retrying("persist detection", || self.stores.detections.persist_detection(photo, &new))
                .map_err(|e| job_store_error(photo, self.config.write_retries, e))?;
            summary.detections += 1;

            let identity = match self.identify(detection, face, snapshot) {
                Ok(Some(identity)) => identity,
                Ok(None) => {
                    tracing::debug!(detection_id = %detection, "no gallery match");
                    continue;
                }
                Err(failure) => {
                    summary.match_failures += 1;
                    tracing::warn!(photo_id = %photo, detection_id = %detection, error = %failure, "match failed; detection left unidentified");
                    continue;
                }
            };

            match self.retrying("attach identity", || self.stores.detections.attach_identity(detection, identity)) {
                Ok(()) => {
                    summary.identified += 1;
                    tracing::debug!(detection_id = %detection, identity_id = %identity, "detection identified");
                }
                Err(StoreError::InactiveIdentity(id)) => {
                    summary.match_failures += 1;
                    let failure = DetectionMatchFailure::InactiveIdentity(id);
                    tracing::warn!(photo_id = %photo, detection_id = %detection, error = %failure, "match failed; detection left unidentified");
                }
                Err(e) => return Err(job_store_error(photo, self.config.write_retries, e)),
            }
        }

        Ok(summary)
    }

    /// Best accepted identity for the face, if any.
    fn identify(
        &self,
        detection: DetectionId,
        face: &ExtractedFace,
        snapshot: &GallerySnapshot,
    ) -> Result<Option<IdentityId>, DetectionMatchFailure> {
        let entries = snapshot
            .entries()
            .map_err(|(identity, source)| DetectionMatchFailure::CorruptGallery {
                identity: *identity,
                source: source.clone(),
            })?;
        let result = self.matcher.compare(&face.descriptor, entries)?;
        if let Some(best) = result.best {
            tracing::debug!(
                detection_id = %detection,
                identity_id = %best.identity,
                similarity = best.similarity,
                matched = result.matched,
                "best candidate"
            );
        }
        Ok(result.identity())
    }

    /// Run a write, retrying transient conflicts with linear backoff.
    fn retrying<T>(&self, what: &str, mut op: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
        let attempts = self.config.write_retries.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Err(StoreError::Conflict(reason)) if attempt < attempts => {
                    tracing::warn!(what, attempt, %reason, "write conflict; retrying");
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn job_store_error(photo: PhotoId, attempts: u32, err: StoreError) -> JobError {
    match err {
        StoreError::Conflict(reason) => JobError::PersistenceConflict {
            photo,
            attempts,
            reason,
        },
        source => JobError::Store { photo, source },
    }
}

/// Releases the photo's in-flight slot when its task ends, however it ends.
/// `DONE` entries are dropped since the processed flag already records them.
struct InFlightSlot {
    inner: Arc<Inner>,
    photo: PhotoId,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        let mut jobs = self.inner.jobs();
        jobs.in_flight.remove(&self.photo);
        match jobs.status.get(&self.photo).map(|s| s.state) {
            Some(JobState::Done) => {
                jobs.status.remove(&self.photo);
            }
            Some(JobState::Failed) | None => {}
            Some(_) => {
                jobs.status
                    .insert(self.photo, JobStatus::failed("job aborted before completion"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use likeness_core::repository::{GalleryRecord, ImageAccessError};
    use likeness_core::{BoundingBox, Descriptor, Detection, ExtractError, Identity, OwnerId};
    use likeness_store::SqliteStore;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::mpsc;

    const OWNER: OwnerId = OwnerId(1);

    fn face(values: &[f32]) -> ExtractedFace {
        ExtractedFace {
            bbox: BoundingBox { x: 4.0, y: 4.0, width: 40.0, height: 40.0, confidence: 0.9 },
            descriptor: Descriptor::new(values.to_vec()).unwrap(),
        }
    }

    /// Returns the faces scripted for the exact image bytes.
    #[derive(Default)]
    struct ScriptedExtractor {
        script: HashMap<Vec<u8>, Vec<ExtractedFace>>,
    }

    impl ScriptedExtractor {
        fn with(mut self, image: &[u8], faces: Vec<ExtractedFace>) -> Self {
            self.script.insert(image.to_vec(), faces);
            self
        }
    }

    impl DescriptorExtractor for ScriptedExtractor {
        fn extract(&self, image: &[u8]) -> Result<Vec<ExtractedFace>, ExtractError> {
            self.script.get(image).cloned().ok_or(ExtractError::EmptyImage)
        }
    }

    /// Signals on entry, then blocks until released once per call.
    struct GatedExtractor {
        inner: ScriptedExtractor,
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    struct Gate {
        entered: mpsc::Receiver<()>,
        release: mpsc::Sender<()>,
    }

    impl Gate {
        async fn wait_entered(&self) {
            tokio::task::block_in_place(|| self.entered.recv_timeout(Duration::from_secs(5)).unwrap());
        }

        fn open(&self) {
            self.release.send(()).unwrap();
        }
    }

    fn gated(inner: ScriptedExtractor) -> (GatedExtractor, Gate) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        (
            GatedExtractor {
                inner,
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            },
            Gate { entered: entered_rx, release: release_tx },
        )
    }

    impl DescriptorExtractor for GatedExtractor {
        fn extract(&self, image: &[u8]) -> Result<Vec<ExtractedFace>, ExtractError> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
            self.inner.extract(image)
        }
    }

    struct SlowExtractor(Duration);

    impl DescriptorExtractor for SlowExtractor {
        fn extract(&self, _image: &[u8]) -> Result<Vec<ExtractedFace>, ExtractError> {
            std::thread::sleep(self.0);
            Ok(vec![])
        }
    }

    #[derive(Default)]
    struct Overlap {
        current: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    /// Sleeps for the given time while counting overlapping calls.
    struct OverlapExtractor(Arc<Overlap>, Duration);

    impl DescriptorExtractor for OverlapExtractor {
        fn extract(&self, _image: &[u8]) -> Result<Vec<ExtractedFace>, ExtractError> {
            let overlap = &self.0;
            overlap.calls.fetch_add(1, Ordering::SeqCst);
            let now = overlap.current.fetch_add(1, Ordering::SeqCst) + 1;
            overlap.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(self.1);
            overlap.current.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![])
        }
    }

    /// Collects formatted log output.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Image bytes keyed by photo; unknown photos are unreadable.
    #[derive(Default)]
    struct MemoryImages {
        images: Mutex<HashMap<PhotoId, Vec<u8>>>,
    }

    impl MemoryImages {
        fn put(&self, photo: PhotoId, bytes: &[u8]) {
            self.images.lock().unwrap().insert(photo, bytes.to_vec());
        }
    }

    impl ImageSource for MemoryImages {
        fn read_image(&self, photo: PhotoId) -> Result<Vec<u8>, ImageAccessError> {
            self.images
                .lock()
                .unwrap()
                .get(&photo)
                .cloned()
                .ok_or(ImageAccessError::NotFound(photo))
        }
    }

    /// Fails the first `conflicts` attaches with a write conflict.
    struct FlakyDetections {
        store: Arc<SqliteStore>,
        conflicts: AtomicU32,
    }

    impl DetectionRepository for FlakyDetections {
        fn persist_detection(&self, photo: PhotoId, detection: &NewDetection<'_>) -> Result<DetectionId, StoreError> {
            self.store.persist_detection(photo, detection)
        }

        fn attach_identity(&self, detection: DetectionId, identity: IdentityId) -> Result<(), StoreError> {
            let remaining = self.conflicts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.conflicts.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Conflict("database is locked".into()));
            }
            self.store.attach_identity(detection, identity)
        }

        fn detections_for_photo(&self, photo: PhotoId) -> Result<Vec<Detection>, StoreError> {
            self.store.detections_for_photo(photo)
        }
    }

    /// Appends an undecodable reference descriptor to every snapshot.
    struct CorruptGallery(Arc<SqliteStore>);

    impl GalleryRepository for CorruptGallery {
        fn gallery_snapshot(&self, owner: OwnerId) -> Result<Vec<GalleryRecord>, StoreError> {
            let mut records = self.0.gallery_snapshot(owner)?;
            records.push(GalleryRecord { identity: IdentityId(999), descriptor: b"garbage".to_vec() });
            Ok(records)
        }
        fn promote_detection(&self, detection: DetectionId, name: Option<&str>) -> Result<IdentityId, StoreError> {
            self.0.promote_detection(detection, name)
        }
        fn rename_identity(&self, identity: IdentityId, name: Option<&str>) -> Result<(), StoreError> {
            self.0.rename_identity(identity, name)
        }
        fn deactivate_identity(&self, identity: IdentityId) -> Result<(), StoreError> {
            self.0.deactivate_identity(identity)
        }
        fn list_identities(&self, owner: OwnerId) -> Result<Vec<Identity>, StoreError> {
            self.0.list_identities(owner)
        }
        fn photos_for_identity(&self, identity: IdentityId) -> Result<Vec<PhotoId>, StoreError> {
            self.0.photos_for_identity(identity)
        }
    }

    struct Harness {
        store: Arc<SqliteStore>,
        images: Arc<MemoryImages>,
        pipeline: Pipeline,
    }

    impl Harness {
        fn new(extractor: impl DescriptorExtractor + 'static) -> Self {
            Self::build(extractor, PipelineConfig::default(), |stores, _| stores)
        }

        fn build(
            extractor: impl DescriptorExtractor + 'static,
            config: PipelineConfig,
            adjust: impl FnOnce(Collaborators, &Arc<SqliteStore>) -> Collaborators,
        ) -> Self {
            let store = Arc::new(SqliteStore::open_in_memory().unwrap());
            let images = Arc::new(MemoryImages::default());
            let mut stores = Collaborators::shared(store.clone());
            stores.images = images.clone();
            let pipeline = Pipeline::new(adjust(stores, &store), Arc::new(extractor), config);
            Self { store, images, pipeline }
        }

        /// A registered photo whose image is `bytes`.
        fn photo(&self, bytes: &[u8]) -> PhotoId {
            let photo = self.store.register_photo(OWNER, "/photos/p.jpg").unwrap();
            self.images.put(photo.id, bytes);
            photo.id
        }

        /// An identity whose reference descriptor is `values`.
        fn identity(&self, values: &[f32]) -> IdentityId {
            let photo = self.store.register_photo(OWNER, "/photos/seed.jpg").unwrap();
            let descriptor = Descriptor::new(values.to_vec()).unwrap();
            let detection = self
                .store
                .persist_detection(
                    photo.id,
                    &NewDetection { bbox: face(values).bbox, descriptor: &descriptor },
                )
                .unwrap();
            self.store.promote_detection(detection, None).unwrap()
        }

        fn detections(&self, photo: PhotoId) -> Vec<Detection> {
            self.store.detections_for_photo(photo).unwrap()
        }

        fn processed(&self, photo: PhotoId) -> bool {
            self.store.photo(photo).unwrap().unwrap().processed
        }
    }

    #[tokio::test]
    async fn test_empty_gallery_persists_unidentified_detections() {
        let h = Harness::new(
            ScriptedExtractor::default().with(b"two", vec![face(&[0.0, 0.0]), face(&[50.0, 50.0])]),
        );
        let photo = h.photo(b"two");

        let summary = h.pipeline.submit(photo).unwrap().wait().await.unwrap();
        assert_eq!(summary.detections, 2);
        assert_eq!(summary.identified, 0);

        let detections = h.detections(photo);
        assert_eq!(detections.len(), 2);
        assert!(detections.iter().all(|d| d.identity.is_none() && !d.identified));
        assert!(h.processed(photo));
        assert_eq!(h.pipeline.status(photo).unwrap(), JobStatus::at(JobState::Done));
    }

    #[tokio::test]
    async fn test_match_above_threshold_identifies_detection() {
        let h = Harness::new(ScriptedExtractor::default().with(b"near", vec![face(&[15.0, 0.0])]));
        let known = h.identity(&[0.0, 0.0]);
        let photo = h.photo(b"near");

        let summary = h.pipeline.submit(photo).unwrap().wait().await.unwrap();
        assert_eq!(summary.identified, 1);

        let detections = h.detections(photo);
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].identity, Some(known));
        assert!(detections[0].identified);
        assert_eq!(h.store.photos_for_identity(known).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_match_below_threshold_stays_unidentified() {
        let h = Harness::new(ScriptedExtractor::default().with(b"far", vec![face(&[50.0, 0.0])]));
        h.identity(&[0.0, 0.0]);
        let photo = h.photo(b"far");

        let summary = h.pipeline.submit(photo).unwrap().wait().await.unwrap();
        assert_eq!(summary.identified, 0);
        assert_eq!(summary.match_failures, 0);
        assert_eq!(h.detections(photo)[0].identity, None);
    }

    #[tokio::test]
    async fn test_deactivated_identity_is_not_matched() {
        let h = Harness::new(ScriptedExtractor::default().with(b"same", vec![face(&[0.0, 0.0])]));
        let known = h.identity(&[0.0, 0.0]);
        h.store.deactivate_identity(known).unwrap();
        let photo = h.photo(b"same");

        h.pipeline.submit(photo).unwrap().wait().await.unwrap();
        assert_eq!(h.detections(photo)[0].identity, None);
    }

    #[tokio::test]
    async fn test_unreadable_image_fails_without_writes() {
        let h = Harness::new(ScriptedExtractor::default());
        let photo = h.store.register_photo(OWNER, "/photos/missing.jpg").unwrap().id;

        let err = h.pipeline.submit(photo).unwrap().wait().await.unwrap_err();
        assert!(matches!(err, JobError::ImageUnreadable { .. }), "{err}");
        assert!(h.detections(photo).is_empty());
        assert!(!h.processed(photo));

        let status = h.pipeline.status(photo).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn test_undecodable_image_fails() {
        let h = Harness::new(ScriptedExtractor::default());
        let photo = h.photo(b"not an image");

        let err = h.pipeline.submit(photo).unwrap().wait().await.unwrap_err();
        assert!(matches!(err, JobError::ImageUnreadable { .. }));
        assert!(!h.processed(photo));
    }

    #[tokio::test]
    async fn test_failed_photo_can_be_resubmitted() {
        let h = Harness::new(ScriptedExtractor::default().with(b"one", vec![face(&[1.0])]));
        let photo = h.store.register_photo(OWNER, "/photos/late.jpg").unwrap().id;

        assert!(h.pipeline.submit(photo).unwrap().wait().await.is_err());
        h.images.put(photo, b"one");
        h.pipeline.submit(photo).unwrap().wait().await.unwrap();
        assert_eq!(h.detections(photo).len(), 1);
        assert!(h.processed(photo));
    }

    #[tokio::test]
    async fn test_zero_faces_marks_processed() {
        let h = Harness::new(ScriptedExtractor::default().with(b"empty", vec![]));
        let photo = h.photo(b"empty");

        let summary = h.pipeline.submit(photo).unwrap().wait().await.unwrap();
        assert_eq!(summary.detections, 0);
        assert!(h.detections(photo).is_empty());
        assert!(h.processed(photo));
    }

    #[tokio::test]
    async fn test_resubmitting_processed_photo_is_rejected() {
        let h = Harness::new(ScriptedExtractor::default().with(b"two", vec![face(&[0.0]), face(&[9.0])]));
        let photo = h.photo(b"two");
        h.pipeline.submit(photo).unwrap().wait().await.unwrap();

        let err = h.pipeline.submit(photo).unwrap_err();
        assert!(matches!(err, SubmitError::AlreadyProcessed(p) if p == photo));
        assert_eq!(h.detections(photo).len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_photo() {
        let h = Harness::new(ScriptedExtractor::default());
        assert!(matches!(h.pipeline.submit(PhotoId(404)), Err(SubmitError::PhotoNotFound(_))));
        assert!(matches!(h.pipeline.status(PhotoId(404)), Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_status_of_unsubmitted_photo_is_new() {
        let h = Harness::new(ScriptedExtractor::default());
        let photo = h.photo(b"x");
        assert_eq!(h.pipeline.status(photo).unwrap(), JobStatus::at(JobState::New));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_submit_runs_once() {
        let (extractor, gate) = gated(ScriptedExtractor::default().with(b"one", vec![face(&[3.0, 4.0])]));
        let h = Harness::new(extractor);
        let photo = h.photo(b"one");

        let first = h.pipeline.submit(photo).unwrap();
        gate.wait_entered().await;
        assert_eq!(h.pipeline.status(photo).unwrap().state, JobState::Extracting);
        assert!(matches!(h.pipeline.submit(photo), Err(SubmitError::AlreadyInFlight(_))));
        assert_eq!(h.pipeline.jobs_in_flight(), 1);

        gate.open();
        first.wait().await.unwrap();
        assert_eq!(h.detections(photo).len(), 1);
        assert_eq!(h.pipeline.jobs_in_flight(), 0);
        assert!(matches!(h.pipeline.submit(photo), Err(SubmitError::AlreadyProcessed(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_identity_visible_only_to_later_snapshots() {
        let (extractor, gate) = gated(
            ScriptedExtractor::default()
                .with(b"first", vec![face(&[10.0, 10.0])])
                .with(b"second", vec![face(&[12.0, 10.0])]),
        );
        let h = Harness::new(extractor);
        let first = h.photo(b"first");
        let second = h.photo(b"second");

        gate.open();
        h.pipeline.submit(first).unwrap().wait().await.unwrap();
        gate.wait_entered().await;
        let detection = h.detections(first)[0].id;

        // The second job snapshots an empty gallery before the identity exists.
        let in_flight = h.pipeline.submit(second).unwrap();
        gate.wait_entered().await;
        let identity = h.pipeline.create_identity(detection, Some("Ada")).unwrap();
        gate.open();
        in_flight.wait().await.unwrap();
        assert_eq!(h.detections(second)[0].identity, None);

        let third = h.photo(b"second");
        gate.open();
        h.pipeline.submit(third).unwrap().wait().await.unwrap();
        gate.wait_entered().await;
        assert_eq!(h.detections(third)[0].identity, Some(identity));

        let promoted = &h.detections(first)[0];
        assert_eq!(promoted.identity, Some(identity));
        assert!(promoted.identified);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_identity_deactivated_mid_job_is_not_attached() {
        let (extractor, gate) = gated(ScriptedExtractor::default().with(b"same", vec![face(&[0.0, 0.0])]));
        let h = Harness::new(extractor);
        let known = h.identity(&[0.0, 0.0]);
        let photo = h.photo(b"same");

        let job = h.pipeline.submit(photo).unwrap();
        gate.wait_entered().await;
        h.store.deactivate_identity(known).unwrap();
        gate.open();

        let summary = job.wait().await.unwrap();
        assert_eq!(summary.identified, 0);
        assert_eq!(summary.match_failures, 1);
        assert_eq!(h.detections(photo)[0].identity, None);
        assert!(h.processed(photo));
    }

    #[tokio::test]
    async fn test_corrupt_gallery_fails_matches_not_job() {
        let h = Harness::build(
            ScriptedExtractor::default().with(b"two", vec![face(&[0.0, 0.0]), face(&[1.0, 1.0])]),
            PipelineConfig::default(),
            |mut stores, store| {
                stores.gallery = Arc::new(CorruptGallery(store.clone()));
                stores
            },
        );
        h.identity(&[0.0, 0.0]);
        let photo = h.photo(b"two");

        let summary = h.pipeline.submit(photo).unwrap().wait().await.unwrap();
        assert_eq!(summary.detections, 2);
        assert_eq!(summary.match_failures, 2);
        assert!(h.detections(photo).iter().all(|d| d.identity.is_none()));
        assert!(h.processed(photo));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_a_match_failure() {
        let h = Harness::new(ScriptedExtractor::default().with(b"short", vec![face(&[0.0])]));
        h.identity(&[0.0, 0.0]);
        let photo = h.photo(b"short");

        let summary = h.pipeline.submit(photo).unwrap().wait().await.unwrap();
        assert_eq!(summary.match_failures, 1);
        assert!(h.processed(photo));
    }

    fn flaky(conflicts: u32) -> impl FnOnce(Collaborators, &Arc<SqliteStore>) -> Collaborators {
        move |mut stores, store| {
            stores.detections = Arc::new(FlakyDetections {
                store: store.clone(),
                conflicts: AtomicU32::new(conflicts),
            });
            stores
        }
    }

    #[tokio::test]
    async fn test_transient_conflicts_are_retried() {
        let h = Harness::build(
            ScriptedExtractor::default().with(b"same", vec![face(&[0.0, 0.0])]),
            PipelineConfig { write_retries: 3, ..PipelineConfig::default() },
            flaky(2),
        );
        let known = h.identity(&[0.0, 0.0]);
        let photo = h.photo(b"same");

        let summary = h.pipeline.submit(photo).unwrap().wait().await.unwrap();
        assert_eq!(summary.identified, 1);
        assert_eq!(h.detections(photo)[0].identity, Some(known));
    }

    #[tokio::test]
    async fn test_exhausted_conflicts_fail_job_and_keep_siblings() {
        let h = Harness::build(
            ScriptedExtractor::default().with(b"two", vec![face(&[0.0, 0.0]), face(&[1.0, 0.0])]),
            PipelineConfig { write_retries: 3, ..PipelineConfig::default() },
            flaky(u32::MAX),
        );
        h.identity(&[0.0, 0.0]);
        let photo = h.photo(b"two");

        let err = h.pipeline.submit(photo).unwrap().wait().await.unwrap_err();
        assert!(matches!(err, JobError::PersistenceConflict { attempts: 3, .. }), "{err}");
        assert_eq!(h.detections(photo).len(), 1);
        assert!(!h.processed(photo));
        assert_eq!(h.pipeline.status(photo).unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_extraction_timeout_fails_job() {
        let h = Harness::build(
            SlowExtractor(Duration::from_millis(500)),
            PipelineConfig { extract_timeout: Duration::from_millis(50), ..PipelineConfig::default() },
            |stores, _| stores,
        );
        let photo = h.photo(b"slow");

        let err = h.pipeline.submit(photo).unwrap().wait().await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(!h.processed(photo));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_permit_completes_every_job() {
        let h = Harness::build(
            ScriptedExtractor::default().with(b"one", vec![face(&[1.0])]),
            PipelineConfig { max_concurrent_jobs: 1, ..PipelineConfig::default() },
            |stores, _| stores,
        );
        let photos: Vec<PhotoId> = (0..3).map(|_| h.photo(b"one")).collect();
        let handles: Vec<JobHandle> = photos.iter().map(|p| h.pipeline.submit(*p).unwrap()).collect();
        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert!(photos.iter().all(|p| h.processed(*p)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_extraction_keeps_its_permit() {
        let overlap = Arc::new(Overlap::default());
        let h = Harness::build(
            OverlapExtractor(overlap.clone(), Duration::from_millis(400)),
            PipelineConfig {
                max_concurrent_jobs: 1,
                extract_timeout: Duration::from_millis(50),
                ..PipelineConfig::default()
            },
            |stores, _| stores,
        );
        let photos: Vec<PhotoId> = (0..3).map(|_| h.photo(b"slow")).collect();
        let handles: Vec<JobHandle> = photos.iter().map(|p| h.pipeline.submit(*p).unwrap()).collect();
        for handle in handles {
            let err = handle.wait().await.unwrap_err();
            assert!(err.to_string().contains("timed out"), "{err}");
        }

        assert_eq!(overlap.calls.load(Ordering::SeqCst), 3);
        assert_eq!(overlap.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finished_jobs_leave_the_job_table() {
        let h = Harness::new(ScriptedExtractor::default().with(b"one", vec![face(&[1.0])]));
        let done = h.photo(b"one");
        let failed = h.photo(b"unscripted");
        h.pipeline.submit(done).unwrap().wait().await.unwrap();
        h.pipeline.submit(failed).unwrap().wait().await.unwrap_err();

        {
            let jobs = h.pipeline.inner.jobs();
            assert!(jobs.in_flight.is_empty());
            assert!(!jobs.status.contains_key(&done));
            assert_eq!(jobs.status.get(&failed).map(|s| s.state), Some(JobState::Failed));
        }
        assert_eq!(h.pipeline.status(done).unwrap(), JobStatus::at(JobState::Done));
        assert_eq!(h.pipeline.status(failed).unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_zero_faces_skip_matching_state() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer({
                let logs = logs.clone();
                move || logs.clone()
            })
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let h = Harness::new(
            ScriptedExtractor::default()
                .with(b"empty", vec![])
                .with(b"one", vec![face(&[1.0])]),
        );
        let empty = h.photo(b"empty");
        h.pipeline.submit(empty).unwrap().wait().await.unwrap();
        let text = logs.text();
        assert!(text.contains("state=PERSISTING"), "{text}");
        assert!(!text.contains("state=MATCHING"), "{text}");

        let one = h.photo(b"one");
        h.pipeline.submit(one).unwrap().wait().await.unwrap();
        assert!(logs.text().contains("state=MATCHING"));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(JobState::Persisting.to_string(), "PERSISTING");
        assert_eq!(serde_json::to_string(&JobState::Failed).unwrap(), "\"FAILED\"");
        assert!(JobState::Done.is_terminal());
        assert!(!JobState::Matching.is_terminal());
    }
}
