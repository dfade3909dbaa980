//! Registry operations: enrollment, lookup, removal and face search.
//!
//! Combines the embedding store, the extraction engine and photo storage.
//! Store mutations hit SQLite and photo files hit the disk, so they run on
//! the blocking pool; reads are served from the store's in-memory snapshot.
//! Photo files are shared between records with identical uploads, so every
//! step that writes or unlinks one runs under `photo_lock`.

use crate::engine::{EngineError, EngineHandle};
use crate::photos::PhotoStore;
use lookout_core::{
    image_extension, Comparison, EmbeddingStore, ExtractError, Match, MatchEngine, MatchError,
    NewPerson, PersonMetadata, PersonRecord, StoreError,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("photo storage: {0}")]
    Photo(#[from] std::io::Error),
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<ExtractError> for RegistryError {
    fn from(e: ExtractError) -> Self {
        RegistryError::Engine(EngineError::Extract(e))
    }
}

#[derive(Clone)]
pub struct Registry {
    store: Arc<EmbeddingStore>,
    photos: Arc<PhotoStore>,
    /// Held from photo save through insert, and from delete through unlink.
    photo_lock: Arc<Mutex<()>>,
    engine: EngineHandle,
    matcher: MatchEngine,
    default_threshold: f32,
}

impl Registry {
    pub fn new(
        store: Arc<EmbeddingStore>,
        photos: PhotoStore,
        engine: EngineHandle,
        matcher: MatchEngine,
        default_threshold: f32,
    ) -> Self {
        Self {
            store,
            photos: Arc::new(photos),
            photo_lock: Arc::new(Mutex::new(())),
            engine,
            matcher,
            default_threshold,
        }
    }

    pub fn store(&self) -> &EmbeddingStore {
        &self.store
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn matcher(&self) -> MatchEngine {
        self.matcher
    }

    pub fn default_threshold(&self) -> f32 {
        self.default_threshold
    }

    /// Enroll a person from a photo. A photo without exactly one detectable
    /// face produces neither a record nor a stored file.
    pub async fn add_person(
        &self,
        name: &str,
        metadata: PersonMetadata,
        photo: Vec<u8>,
    ) -> Result<i64, RegistryError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(RegistryError::InvalidInput("name is required".into()));
        }
        let extension = image_extension(&photo)?;

        let embedding = self.engine.extract(photo.clone()).await?;

        let _guard = self.photo_lock.lock().await;
        let store = Arc::clone(&self.store);
        let photos = Arc::clone(&self.photos);
        tokio::task::spawn_blocking(move || -> Result<i64, RegistryError> {
            let photo_ref = photos.save(&photo, extension)?;
            let new_person = NewPerson {
                name,
                metadata,
                embedding,
                photo_ref: Some(photo_ref.clone()),
            };
            store.insert(new_person).map_err(|e| {
                release_photo(&store, &photos, &photo_ref);
                RegistryError::from(e)
            })
        })
        .await?
    }

    pub fn get_person(&self, id: i64) -> Result<PersonRecord, RegistryError> {
        Ok(self.store.get(id)?)
    }

    pub fn list_persons(&self) -> Result<Arc<Vec<PersonRecord>>, RegistryError> {
        Ok(self.store.all()?)
    }

    pub async fn remove_person(&self, id: i64) -> Result<(), RegistryError> {
        let _guard = self.photo_lock.lock().await;
        let store = Arc::clone(&self.store);
        let photos = Arc::clone(&self.photos);
        tokio::task::spawn_blocking(move || -> Result<(), RegistryError> {
            let removed = store.delete(id)?;
            if let Some(photo_ref) = removed.photo_ref {
                release_photo(&store, &photos, &photo_ref);
            }
            Ok(())
        })
        .await?
    }

    pub async fn update_metadata(
        &self,
        id: i64,
        metadata: PersonMetadata,
    ) -> Result<(), RegistryError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.update_metadata(id, metadata)).await??;
        Ok(())
    }

    /// Search the registry with a photo. `threshold = None` uses the
    /// configured default.
    pub async fn search(
        &self,
        photo: Vec<u8>,
        threshold: Option<f32>,
        top_k: Option<usize>,
    ) -> Result<Vec<Match>, RegistryError> {
        let threshold = threshold.unwrap_or(self.default_threshold);
        let query = self.engine.extract(photo).await?;
        let matches = self
            .matcher
            .find_matches(&self.store, &query, threshold, top_k)?;

        tracing::info!(threshold, matches = matches.len(), "search completed");
        Ok(matches)
    }

    /// Compare the faces in two photos directly.
    pub async fn compare(
        &self,
        photo_a: Vec<u8>,
        photo_b: Vec<u8>,
        threshold: Option<f32>,
    ) -> Result<Comparison, RegistryError> {
        let threshold = threshold.unwrap_or(self.default_threshold);
        let a = self.engine.extract(photo_a).await?;
        let b = self.engine.extract(photo_b).await?;
        Ok(self.matcher.compare(&a, &b, threshold)?)
    }
}

/// Delete a photo file unless another record still points at it
/// (identical uploads share one content-addressed file). Callers hold
/// `photo_lock`.
fn release_photo(store: &EmbeddingStore, photos: &PhotoStore, photo_ref: &str) {
    let still_used = store
        .all()
        .map(|all| all.iter().any(|r| r.photo_ref.as_deref() == Some(photo_ref)))
        .unwrap_or(true);
    if still_used {
        return;
    }
    if let Err(err) = photos.remove(photo_ref) {
        tracing::warn!(photo_ref, error = %err, "failed to remove photo");
    }
}
