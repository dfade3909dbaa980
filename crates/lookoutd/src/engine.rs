use lookout_core::{Embedding, EmbeddingExtractor, ExtractError};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    Extract {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Embedding, ExtractError>>,
    },
}

/// Clone-safe handle to the extraction thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    dimension: usize,
    model_version: String,
}

impl EngineHandle {
    /// Extract a face embedding from encoded photo bytes.
    pub async fn extract(&self, image: Vec<u8>) -> Result<Embedding, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Extract {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }
}

/// Run the extractor on a dedicated OS thread.
///
/// Inference sessions need exclusive access and are CPU-bound, so they live
/// off the async runtime; requests are served one at a time in arrival order.
pub fn spawn_engine(mut extractor: Box<dyn EmbeddingExtractor>) -> Result<EngineHandle, EngineError> {
    let dimension = extractor.dimension();
    let model_version = extractor.model_version().to_string();
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("lookout-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Extract { image, reply } => {
                        let result = extractor.extract(&image);
                        match &result {
                            Ok(e) => tracing::debug!(dimension = e.dimension(), "embedding extracted"),
                            Err(err) => tracing::info!(error = %err, "extraction rejected"),
                        }
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    tracing::info!(dimension, model = %model_version, "extraction engine ready");

    Ok(EngineHandle {
        tx,
        dimension,
        model_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Returns a fixed vector for any non-empty input.
    struct FixedExtractor(Vec<f32>);

    impl EmbeddingExtractor for FixedExtractor {
        fn dimension(&self) -> usize {
            self.0.len()
        }

        fn model_version(&self) -> &str {
            "fixed"
        }

        fn extract(&mut self, image_bytes: &[u8]) -> Result<Embedding, ExtractError> {
            if image_bytes.is_empty() {
                return Err(ExtractError::NoFaceDetected { faces: 0 });
            }
            Ok(Embedding::new(self.0.clone()))
        }
    }

    #[tokio::test]
    async fn test_extract_round_trip_through_thread() {
        let handle = spawn_engine(Box::new(FixedExtractor(vec![0.5, 0.5]))).unwrap();
        assert_eq!(handle.dimension(), 2);
        assert_eq!(handle.model_version(), "fixed");

        let emb = handle.extract(vec![1, 2, 3]).await.unwrap();
        assert_eq!(emb.values, vec![0.5, 0.5]);
    }

    #[tokio::test]
    async fn test_extract_error_is_propagated() {
        let handle = spawn_engine(Box::new(FixedExtractor(vec![1.0]))).unwrap();
        let err = handle.extract(Vec::new()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Extract(ExtractError::NoFaceDetected { faces: 0 })
        ));
    }
}
