//! lookout-core - Face registry engine.
//!
//! Stores person records with face embeddings in SQLite and ranks them by
//! distance to a query embedding. Embeddings come from a pluggable extractor
//! (SCRFD + ArcFace via ONNX Runtime, or a model-free histogram descriptor).

pub mod extract;
pub mod matcher;
pub mod store;
pub mod types;

pub use extract::{build_extractor, image_extension, Backend, EmbeddingExtractor, ExtractError};
pub use matcher::{Comparison, DistanceMetric, MatchEngine, MatchError, DEFAULT_THRESHOLD};
pub use store::{EmbeddingStore, StoreError};
pub use types::{
    ConfidenceBand, Embedding, InvalidEmbedding, Match, NewPerson, PersonMetadata, PersonRecord,
};
