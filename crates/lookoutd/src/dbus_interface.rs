use crate::engine::EngineError;
use crate::registry::{Registry, RegistryError};
use lookout_core::{ExtractError, Match, MatchError, PersonMetadata, PersonRecord, StoreError};
use serde::Serialize;
use zbus::fdo;
use zbus::interface;

pub const BUS_NAME: &str = "org.lookout.Registry1";
pub const OBJECT_PATH: &str = "/org/lookout/Registry1";

/// D-Bus interface for the Lookout registry daemon.
///
/// Bus name: org.lookout.Registry1
/// Object path: /org/lookout/Registry1
pub struct RegistryService {
    registry: Registry,
}

impl RegistryService {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }
}

/// Person as exposed to clients. The embedding stays inside the daemon.
#[derive(Serialize)]
struct PersonView<'a> {
    id: i64,
    name: &'a str,
    #[serde(flatten)]
    metadata: &'a PersonMetadata,
    photo_ref: Option<&'a str>,
    created_at: String,
}

impl<'a> From<&'a PersonRecord> for PersonView<'a> {
    fn from(r: &'a PersonRecord) -> Self {
        Self {
            id: r.id,
            name: &r.name,
            metadata: &r.metadata,
            photo_ref: r.photo_ref.as_deref(),
            created_at: r.created_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
struct MatchView<'a> {
    #[serde(flatten)]
    person: PersonView<'a>,
    distance: f32,
    confidence: f32,
    band: &'static str,
}

impl<'a> From<&'a Match> for MatchView<'a> {
    fn from(m: &'a Match) -> Self {
        Self {
            person: PersonView::from(&m.record),
            distance: m.distance,
            confidence: m.confidence,
            band: m.band().as_str(),
        }
    }
}

#[interface(name = "org.lookout.Registry1")]
impl RegistryService {
    /// Enroll a person from a photo. Returns the new record id.
    async fn add_person(
        &self,
        name: &str,
        metadata_json: &str,
        photo: Vec<u8>,
    ) -> fdo::Result<i64> {
        tracing::info!(name, bytes = photo.len(), "add_person requested");
        let metadata = parse_metadata(metadata_json)?;
        self.registry
            .add_person(name, metadata, photo)
            .await
            .map_err(to_fdo)
    }

    /// Fetch one person as JSON.
    async fn get_person(&self, id: i64) -> fdo::Result<String> {
        let record = self.registry.get_person(id).map_err(to_fdo)?;
        to_json(&PersonView::from(&record))
    }

    /// All persons in insertion order, as a JSON array.
    async fn list_persons(&self) -> fdo::Result<String> {
        let all = self.registry.list_persons().map_err(to_fdo)?;
        let views: Vec<PersonView<'_>> = all.iter().map(PersonView::from).collect();
        to_json(&views)
    }

    async fn remove_person(&self, id: i64) -> fdo::Result<()> {
        tracing::info!(id, "remove_person requested");
        self.registry.remove_person(id).await.map_err(to_fdo)
    }

    /// Replace a person's metadata; the face embedding is untouched.
    async fn update_metadata(&self, id: i64, metadata_json: &str) -> fdo::Result<()> {
        tracing::info!(id, "update_metadata requested");
        let metadata = parse_metadata(metadata_json)?;
        self.registry
            .update_metadata(id, metadata)
            .await
            .map_err(to_fdo)
    }

    /// Search with a photo. A negative threshold selects the daemon default;
    /// `top_k = 0` returns every match.
    async fn search(&self, photo: Vec<u8>, threshold: f64, top_k: u32) -> fdo::Result<String> {
        tracing::info!(bytes = photo.len(), threshold, top_k, "search requested");
        let threshold = threshold_arg(threshold);
        let top_k = top_k_arg(top_k);

        let matches = self
            .registry
            .search(photo, threshold, top_k)
            .await
            .map_err(to_fdo)?;
        let views: Vec<MatchView<'_>> = matches.iter().map(MatchView::from).collect();
        to_json(&views)
    }

    /// Compare the faces in two photos. Negative threshold selects the default.
    async fn compare(&self, photo_a: Vec<u8>, photo_b: Vec<u8>, threshold: f64) -> fdo::Result<String> {
        let threshold = threshold_arg(threshold);
        let cmp = self
            .registry
            .compare(photo_a, photo_b, threshold)
            .await
            .map_err(to_fdo)?;
        to_json(&cmp)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let persons = self.registry.store().len().map_err(|e| to_fdo(e.into()))?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "persons": persons,
            "dimension": self.registry.store().dimension(),
            "model": self.registry.engine().model_version(),
            "metric": self.registry.matcher().metric(),
            "default_threshold": self.registry.default_threshold(),
        })
        .to_string())
    }
}

/// Negative (or NaN) selects the daemon default.
fn threshold_arg(threshold: f64) -> Option<f32> {
    (threshold >= 0.0).then_some(threshold as f32)
}

/// On the bus 0 means "no limit"; the match engine reads `Some(0)` as an
/// empty cap, so 0 becomes `None` here.
fn top_k_arg(top_k: u32) -> Option<usize> {
    (top_k > 0).then_some(top_k as usize)
}

fn parse_metadata(json: &str) -> fdo::Result<PersonMetadata> {
    if json.trim().is_empty() {
        return Ok(PersonMetadata::default());
    }
    serde_json::from_str(json)
        .map_err(|e| fdo::Error::InvalidArgs(format!("bad metadata JSON: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

/// Map registry errors onto D-Bus error names. Caller mistakes become
/// `InvalidArgs`/`UnknownObject`; the rest are daemon failures.
fn to_fdo(err: RegistryError) -> fdo::Error {
    let msg = err.to_string();
    match err {
        RegistryError::Store(StoreError::NotFound(_)) => fdo::Error::UnknownObject(msg),
        RegistryError::InvalidInput(_)
        | RegistryError::Store(StoreError::InvalidInput(_))
        | RegistryError::Store(StoreError::DimensionMismatch { .. })
        | RegistryError::Match(MatchError::DimensionMismatch { .. })
        | RegistryError::Match(MatchError::InvalidInput(_)) => {
            fdo::Error::InvalidArgs(msg)
        }
        RegistryError::Engine(EngineError::Extract(e)) if is_caller_error(&e) => {
            fdo::Error::InvalidArgs(msg)
        }
        _ => {
            tracing::error!(error = %msg, "request failed");
            fdo::Error::Failed(msg)
        }
    }
}

fn is_caller_error(e: &ExtractError) -> bool {
    matches!(
        e,
        ExtractError::EmptyImage
            | ExtractError::TooLarge(_)
            | ExtractError::UnsupportedFormat
            | ExtractError::Decode(_)
            | ExtractError::NoFaceDetected { .. }
    )
}
