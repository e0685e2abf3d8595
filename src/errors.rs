use crate::{embedding::EmbeddingError, sources::SourceError, store::StoreError};

/// Error taxonomy surfaced by the service layer and mapped to HTTP statuses.
#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("missing or invalid credentials")]
    Auth,

    #[error("{0}")]
    NotFound(String),

    #[error("embedding has {got} dimensions, store expects {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("embedding generation failed: {0}")]
    EmbeddingGenerationFailed(String),

    #[error("not enough data: {requested} clusters requested but only {available} embeddings stored")]
    InsufficientData { requested: usize, available: usize },

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DimensionMismatch { expected, got } => {
                ServiceError::DimensionMismatch { expected, got }
            }
            StoreError::InvalidArgument(msg) => ServiceError::Validation(msg),
            StoreError::InsufficientData {
                requested,
                available,
            } => ServiceError::InsufficientData {
                requested,
                available,
            },
            StoreError::Persist(e) => ServiceError::Storage(e.to_string()),
            StoreError::Internal(msg) => ServiceError::Storage(msg),
        }
    }
}

impl From<EmbeddingError> for ServiceError {
    fn from(err: EmbeddingError) -> Self {
        ServiceError::EmbeddingGenerationFailed(err.to_string())
    }
}

impl From<SourceError> for ServiceError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Invalid(msg) => ServiceError::Validation(msg),
            SourceError::Conflict(id) => {
                ServiceError::Validation(format!("source id {id} is already in use"))
            }
            SourceError::IO(e) => ServiceError::Storage(e.to_string()),
            SourceError::Json(e) => ServiceError::Storage(e.to_string()),
            SourceError::Internal(msg) => ServiceError::Storage(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_mapping() {
        let err: ServiceError = StoreError::DimensionMismatch { expected: 3, got: 2 }.into();
        assert!(matches!(err, ServiceError::DimensionMismatch { expected: 3, got: 2 }));

        let err: ServiceError = StoreError::InvalidArgument("bad".into()).into();
        assert!(matches!(err, ServiceError::Validation(_)));

        let err: ServiceError = StoreError::InsufficientData {
            requested: 4,
            available: 1,
        }
        .into();
        assert!(matches!(err, ServiceError::InsufficientData { .. }));

        let err: ServiceError = StoreError::Internal("Lock poisoned".into()).into();
        assert!(matches!(err, ServiceError::Storage(_)));
    }

    #[test]
    fn test_embedding_error_mapping() {
        let err: ServiceError = EmbeddingError::Transport("timed out".into()).into();
        assert!(matches!(err, ServiceError::EmbeddingGenerationFailed(_)));
        assert!(err.to_string().contains("timed out"));
    }
}
