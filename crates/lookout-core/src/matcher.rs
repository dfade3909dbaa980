//! Nearest-embedding matching with a distance threshold.
//!
//! Full scan over a store snapshot: O(n·d) per query, no index.

use crate::store::{EmbeddingStore, StoreError};
use crate::types::{Embedding, InvalidEmbedding, Match, PersonRecord};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distance threshold used when the caller does not supply one.
pub const DEFAULT_THRESHOLD: f32 = 0.6;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("query dimension mismatch: store holds {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid input: {0}")]
    InvalidInput(#[from] InvalidEmbedding),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How two embeddings are compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    /// `1 - cosine similarity`; suited to L2-normalised embeddings.
    Cosine,
}

impl DistanceMetric {
    pub fn distance(&self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            DistanceMetric::Euclidean => a.euclidean_distance(b),
            DistanceMetric::Cosine => a.cosine_distance(b),
        }
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "cosine" => Ok(DistanceMetric::Cosine),
            other => Err(format!("unknown distance metric: {other}")),
        }
    }
}

/// Outcome of comparing two embeddings directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Comparison {
    pub matched: bool,
    pub distance: f32,
    pub confidence: f32,
}

/// Map a distance to a confidence in [0, 1].
///
/// `1 - distance / threshold`, clamped. With a non-positive threshold only an
/// exact duplicate qualifies, and it scores 1.0. An infinite threshold gives
/// every finite distance full confidence; a non-finite distance scores 0.
pub fn confidence(distance: f32, threshold: f32) -> f32 {
    if !distance.is_finite() {
        return 0.0;
    }
    if threshold.is_nan() || threshold <= 0.0 {
        return if distance == 0.0 { 1.0 } else { 0.0 };
    }
    if threshold.is_infinite() {
        return 1.0;
    }
    (1.0 - distance / threshold).clamp(0.0, 1.0)
}

/// Whether `distance` is close enough to count as a match. A distance that
/// overflowed to infinity never matches.
fn within(distance: f32, threshold: f32) -> bool {
    if !distance.is_finite() {
        false
    } else if threshold > 0.0 {
        distance <= threshold
    } else {
        distance == 0.0
    }
}

/// Ranks stored records by similarity to a query embedding.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchEngine {
    metric: DistanceMetric,
}

impl MatchEngine {
    pub fn new(metric: DistanceMetric) -> Self {
        Self { metric }
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Find stored records within `threshold` of `query`, closest first.
    ///
    /// Works on a snapshot taken at call time, so concurrent inserts and
    /// deletes never produce a half-updated result. `top_k = None` returns
    /// every survivor; `Some(0)` returns none.
    ///
    /// An empty or non-finite query is rejected with `InvalidInput`.
    pub fn find_matches(
        &self,
        store: &EmbeddingStore,
        query: &Embedding,
        threshold: f32,
        top_k: Option<usize>,
    ) -> Result<Vec<Match>, MatchError> {
        query.validate()?;
        if query.dimension() != store.dimension() {
            return Err(MatchError::DimensionMismatch {
                expected: store.dimension(),
                actual: query.dimension(),
            });
        }

        let snapshot = store.all()?;
        let matches = self.rank(query, &snapshot, threshold, top_k);

        tracing::debug!(
            scanned = snapshot.len(),
            matched = matches.len(),
            threshold,
            metric = ?self.metric,
            "find_matches"
        );
        Ok(matches)
    }

    /// Rank `records` against `query`. Ties keep the order of `records`.
    ///
    /// `top_k` is a plain cap: `Some(0)` yields an empty list. Interfaces that
    /// use 0 to mean "unlimited" must map it to `None` first.
    pub fn rank(
        &self,
        query: &Embedding,
        records: &[PersonRecord],
        threshold: f32,
        top_k: Option<usize>,
    ) -> Vec<Match> {
        let mut matches: Vec<Match> = records
            .iter()
            .filter_map(|record| {
                let distance = self.metric.distance(query, &record.embedding);
                within(distance, threshold).then(|| Match {
                    record: record.clone(),
                    distance,
                    confidence: confidence(distance, threshold),
                })
            })
            .collect();

        // Stable sort: equal distances stay in store order.
        matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));

        if let Some(k) = top_k {
            matches.truncate(k);
        }
        matches
    }

    /// Compare two embeddings without consulting a store.
    pub fn compare(
        &self,
        a: &Embedding,
        b: &Embedding,
        threshold: f32,
    ) -> Result<Comparison, MatchError> {
        a.validate()?;
        b.validate()?;
        if a.dimension() != b.dimension() {
            return Err(MatchError::DimensionMismatch {
                expected: a.dimension(),
                actual: b.dimension(),
            });
        }
        let distance = self.metric.distance(a, b);
        let matched = within(distance, threshold);
        Ok(Comparison {
            matched,
            distance,
            confidence: if matched {
                confidence(distance, threshold)
            } else {
                0.0
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewPerson, PersonMetadata};

    fn store_with(dimension: usize, people: &[(&str, Vec<f32>)]) -> EmbeddingStore {
        let store = EmbeddingStore::open_in_memory(dimension).unwrap();
        for (name, values) in people {
            store
                .insert(NewPerson {
                    name: name.to_string(),
                    metadata: PersonMetadata::default(),
                    embedding: Embedding::new(values.clone()),
                    photo_ref: None,
                })
                .unwrap();
        }
        store
    }

    fn names(matches: &[Match]) -> Vec<&str> {
        matches.iter().map(|m| m.record.name.as_str()).collect()
    }

    #[test]
    fn test_ranked_by_ascending_distance() {
        let store = store_with(2, &[("B", vec![3.0, 4.0]), ("A", vec![0.0, 0.0])]);
        let query = Embedding::new(vec![0.0, 0.0]);

        let matches = MatchEngine::default()
            .find_matches(&store, &query, 10.0, None)
            .unwrap();

        assert_eq!(names(&matches), ["A", "B"]);
        assert_eq!(matches[0].distance, 0.0);
        assert_eq!(matches[0].confidence, 1.0);
        assert!((matches[1].distance - 5.0).abs() < 1e-6);
        assert!((matches[1].confidence - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_threshold_excludes_far_records() {
        let store = store_with(1, &[("near", vec![1.0]), ("far", vec![2.0])]);
        let query = Embedding::new(vec![0.0]);

        let matches = MatchEngine::default()
            .find_matches(&store, &query, 1.5, None)
            .unwrap();
        assert_eq!(names(&matches), ["near"]);
        assert!((matches[0].distance - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_store_returns_empty() {
        let store = store_with(3, &[]);
        let query = Embedding::new(vec![0.1, 0.2, 0.3]);
        let matches = MatchEngine::default()
            .find_matches(&store, &query, DEFAULT_THRESHOLD, None)
            .unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn test_query_dimension_mismatch() {
        let store = store_with(3, &[("A", vec![0.0, 0.0, 0.0])]);
        let query = Embedding::new(vec![0.0, 0.0]);
        let err = MatchEngine::default()
            .find_matches(&store, &query, 1.0, None)
            .unwrap_err();
        assert!(matches!(
            err,
            MatchError::DimensionMismatch { expected: 3, actual: 2 }
        ));
    }

    #[test]
    fn test_self_query_ranks_first_with_full_confidence() {
        let store = store_with(
            3,
            &[
                ("x", vec![0.9, 0.1, 0.0]),
                ("self", vec![0.2, 0.4, 0.6]),
                ("y", vec![0.2, 0.4, 0.5]),
            ],
        );
        let query = Embedding::new(vec![0.2, 0.4, 0.6]);

        for threshold in [0.0, 0.05, 0.6, 5.0] {
            let matches = MatchEngine::default()
                .find_matches(&store, &query, threshold, None)
                .unwrap();
            assert_eq!(matches[0].record.name, "self", "threshold {threshold}");
            assert_eq!(matches[0].distance, 0.0);
            assert_eq!(matches[0].confidence, 1.0);
        }
    }

    #[test]
    fn test_ties_keep_store_order_and_are_repeatable() {
        let store = store_with(
            2,
            &[
                ("first", vec![1.0, 0.0]),
                ("second", vec![0.0, 1.0]),
                ("third", vec![-1.0, 0.0]),
            ],
        );
        let query = Embedding::new(vec![0.0, 0.0]);
        let engine = MatchEngine::default();

        let a = engine.find_matches(&store, &query, 2.0, None).unwrap();
        let b = engine.find_matches(&store, &query, 2.0, None).unwrap();
        assert_eq!(names(&a), ["first", "second", "third"]);
        assert_eq!(names(&a), names(&b));
    }

    #[test]
    fn test_top_k_truncates() {
        let store = store_with(
            1,
            &[("a", vec![0.3]), ("b", vec![0.1]), ("c", vec![0.2])],
        );
        let query = Embedding::new(vec![0.0]);
        let engine = MatchEngine::default();

        let top2 = engine.find_matches(&store, &query, 1.0, Some(2)).unwrap();
        assert_eq!(names(&top2), ["b", "c"]);

        let none = engine.find_matches(&store, &query, 1.0, Some(0)).unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_non_positive_threshold_only_exact_duplicates() {
        let store = store_with(1, &[("dup", vec![0.5]), ("other", vec![0.6])]);
        let query = Embedding::new(vec![0.5]);
        let engine = MatchEngine::default();

        for threshold in [0.0, -1.0, f32::NAN] {
            let matches = engine.find_matches(&store, &query, threshold, None).unwrap();
            assert_eq!(names(&matches), ["dup"]);
            assert_eq!(matches[0].confidence, 1.0);
        }

        let miss = Embedding::new(vec![0.55]);
        assert!(engine.find_matches(&store, &miss, -1.0, None).unwrap().is_empty());
    }

    #[test]
    fn test_confidence_is_bounded_and_monotonic() {
        let mut prev = f32::INFINITY;
        for step in 0..=20 {
            let d = step as f32 * 0.05;
            let c = confidence(d, 0.6);
            assert!((0.0..=1.0).contains(&c));
            assert!(c <= prev);
            prev = c;
        }
        assert_eq!(confidence(0.6, 0.6), 0.0);
        assert_eq!(confidence(0.0, 0.6), 1.0);
    }

    #[test]
    fn test_confidence_infinite_threshold_and_distance() {
        assert_eq!(confidence(0.4, f32::INFINITY), 1.0);
        assert_eq!(confidence(f32::INFINITY, f32::INFINITY), 0.0);
        assert_eq!(confidence(f32::INFINITY, 0.6), 0.0);
        assert_eq!(confidence(f32::NAN, 0.6), 0.0);
        assert!(!within(f32::INFINITY, f32::INFINITY));
        assert!(within(1e30, f32::INFINITY));
    }

    #[test]
    fn test_overflowing_distance_never_matches() {
        // 1e20 squared overflows f32.
        let store = store_with(1, &[("far", vec![1e20]), ("near", vec![1.0])]);
        let query = Embedding::new(vec![0.0]);

        let matches = MatchEngine::default()
            .find_matches(&store, &query, f32::INFINITY, None)
            .unwrap();
        assert_eq!(names(&matches), ["near"]);
        for m in &matches {
            assert!((0.0..=1.0).contains(&m.confidence));
        }
    }

    #[test]
    fn test_invalid_query_is_reported() {
        let store = store_with(2, &[("A", vec![0.0, 0.0])]);
        let engine = MatchEngine::default();

        let nan = Embedding::new(vec![f32::NAN, 0.0]);
        assert!(matches!(
            engine.find_matches(&store, &nan, 1.0, None),
            Err(MatchError::InvalidInput(InvalidEmbedding::NonFinite))
        ));

        let empty = Embedding::new(vec![]);
        assert!(matches!(
            engine.find_matches(&store, &empty, 1.0, None),
            Err(MatchError::InvalidInput(InvalidEmbedding::Empty))
        ));

        let ok = Embedding::new(vec![0.0, 0.0]);
        assert!(matches!(
            engine.compare(&ok, &nan, 1.0),
            Err(MatchError::InvalidInput(InvalidEmbedding::NonFinite))
        ));
    }

    #[test]
    fn test_cosine_metric() {
        let store = store_with(2, &[("same_dir", vec![2.0, 0.0]), ("ortho", vec![0.0, 1.0])]);
        let query = Embedding::new(vec![1.0, 0.0]);

        let matches = MatchEngine::new(DistanceMetric::Cosine)
            .find_matches(&store, &query, 0.5, None)
            .unwrap();
        assert_eq!(names(&matches), ["same_dir"]);
        assert!(matches[0].distance.abs() < 1e-6);
    }

    #[test]
    fn test_compare() {
        let engine = MatchEngine::default();
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![0.3, 0.4]);

        let close = engine.compare(&a, &b, 0.6).unwrap();
        assert!(close.matched);
        assert!((close.distance - 0.5).abs() < 1e-6);

        let far = engine.compare(&a, &b, 0.4).unwrap();
        assert!(!far.matched);
        assert_eq!(far.confidence, 0.0);

        let short = Embedding::new(vec![0.0]);
        assert!(engine.compare(&a, &short, 0.6).is_err());
    }

    #[test]
    fn test_metric_from_str() {
        assert_eq!("Cosine".parse::<DistanceMetric>().unwrap(), DistanceMetric::Cosine);
        assert_eq!("l2".parse::<DistanceMetric>().unwrap(), DistanceMetric::Euclidean);
        assert!("manhattan".parse::<DistanceMetric>().is_err());
    }
}
