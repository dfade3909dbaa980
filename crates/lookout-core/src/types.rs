use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an embedding cannot be stored or queried.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidEmbedding {
    #[error("embedding must not be empty")]
    Empty,
    #[error("embedding contains non-finite values")]
    NonFinite,
}

/// Face embedding vector (128-dim for dlib-style models, 512 for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Cosine distance (`1 - cosine similarity`), in [0, 2].
    ///
    /// A zero-norm operand has no direction; it is reported at distance 1.0.
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            1.0 - dot / denom
        } else {
            1.0
        }
    }

    /// True when every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Reject vectors that no distance can be computed against.
    pub fn validate(&self) -> Result<(), InvalidEmbedding> {
        if self.values.is_empty() {
            return Err(InvalidEmbedding::Empty);
        }
        if !self.is_finite() {
            return Err(InvalidEmbedding::NonFinite);
        }
        Ok(())
    }

    /// Serialize to a fixed-length little-endian f32 blob (4 bytes per dimension).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Parse a blob written by [`to_le_bytes`](Self::to_le_bytes).
    ///
    /// Returns `None` if the length is not a multiple of 4.
    pub fn from_le_bytes(bytes: &[u8], model_version: Option<String>) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self {
            values,
            model_version,
        })
    }
}

/// Descriptive fields attached to a person. This is the closed set of
/// recognized keys; unknown keys are rejected when parsed from JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PersonMetadata {
    pub age: Option<String>,
    pub description: Option<String>,
    pub date_missing: Option<String>,
    pub contact: Option<String>,
}

impl PersonMetadata {
    /// Trim every field and turn blank strings into `None`.
    pub fn normalized(self) -> Self {
        fn clean(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }
        Self {
            age: clean(self.age),
            description: clean(self.description),
            date_missing: clean(self.date_missing),
            contact: clean(self.contact),
        }
    }
}

/// Input for [`EmbeddingStore::insert`](crate::store::EmbeddingStore::insert).
#[derive(Debug, Clone)]
pub struct NewPerson {
    pub name: String,
    pub metadata: PersonMetadata,
    pub embedding: Embedding,
    /// Opaque handle to the stored photo (file name, object key, ...).
    pub photo_ref: Option<String>,
}

/// A stored person with its face embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonRecord {
    /// Assigned at insertion, never reused.
    pub id: i64,
    pub name: String,
    pub metadata: PersonMetadata,
    pub embedding: Embedding,
    pub photo_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One ranked candidate returned by the match engine.
#[derive(Debug, Clone, Serialize)]
pub struct Match {
    pub record: PersonRecord,
    pub distance: f32,
    /// Normalized score in [0, 1]; higher = more similar.
    pub confidence: f32,
}

impl Match {
    pub fn band(&self) -> ConfidenceBand {
        ConfidenceBand::from_confidence(self.confidence)
    }
}

/// Coarse bucket for presenting a confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceBand {
    High,
    Medium,
    Low,
}

impl ConfidenceBand {
    pub fn from_confidence(confidence: f32) -> Self {
        if confidence >= 0.80 {
            ConfidenceBand::High
        } else if confidence >= 0.60 {
            ConfidenceBand::Medium
        } else {
            ConfidenceBand::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceBand::High => "high",
            ConfidenceBand::Medium => "medium",
            ConfidenceBand::Low => "low",
        }
    }
}
