//! Error taxonomy for the ingestion pipeline.
//!
//! Row-level errors ([`Validation`](IngestError::Validation),
//! [`DuplicateKey`](IngestError::DuplicateKey),
//! [`Referential`](IngestError::Referential) and ordinary datastore failures)
//! are recorded against a row and the batch continues. Everything else aborts
//! processing of the current message and fails the job.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The CSV body as a whole is unusable (too few lines).
    #[error("{0}")]
    Format(String),

    /// A row has a missing required field or a value that does not parse.
    #[error("{message}")]
    Validation { row: u64, message: String },

    /// A product with this identifier already exists.
    #[error("Product with ID '{0}' already exists")]
    DuplicateKey(String),

    /// A subcategory reference cannot be resolved under the row's category.
    #[error("{0}")]
    Referential(String),

    /// The broker connection or publish failed.
    #[error("queue transport error: {0}")]
    Transport(String),

    /// A job could not be handed to the queue.
    #[error("{0}")]
    Queue(String),

    /// A caller-supplied argument is out of range or empty.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("{0}")]
    NotFound(String),

    /// Invalid job state transition, or delete while processing.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl IngestError {
    pub fn validation(row: u64, message: impl Into<String>) -> Self {
        Self::Validation {
            row,
            message: message.into(),
        }
    }

    /// Whether this error should be contained to the row that raised it.
    ///
    /// Datastore errors count as row-level unless the datastore itself has
    /// become unreachable, in which case continuing would fail every
    /// remaining row the same way.
    pub fn is_row_level(&self) -> bool {
        match self {
            IngestError::Validation { .. }
            | IngestError::DuplicateKey(_)
            | IngestError::Referential(_) => true,
            IngestError::Store(err) => !is_connectivity_error(err),
            _ => false,
        }
    }
}

fn is_connectivity_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<sqlx::Error>(),
            Some(sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
        ) || cause.downcast_ref::<std::io::Error>().is_some()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_level_classification() {
        assert!(IngestError::validation(2, "Brand is required").is_row_level());
        assert!(IngestError::DuplicateKey("p-1".into()).is_row_level());
        assert!(IngestError::Referential("bad parent".into()).is_row_level());
        assert!(IngestError::Store(anyhow::anyhow!("constraint failed")).is_row_level());
        assert!(!IngestError::Format("too short".into()).is_row_level());
        assert!(!IngestError::Transport("down".into()).is_row_level());
    }

    #[test]
    fn closed_pool_is_job_fatal() {
        let err = IngestError::Store(anyhow::Error::new(sqlx::Error::PoolClosed));
        assert!(!err.is_row_level());

        let wrapped = IngestError::Store(
            anyhow::Error::new(sqlx::Error::PoolTimedOut).context("insert product"),
        );
        assert!(!wrapped.is_row_level());
    }

    #[test]
    fn duplicate_key_message() {
        let err = IngestError::DuplicateKey("SKU-9".into());
        assert_eq!(err.to_string(), "Product with ID 'SKU-9' already exists");
    }
}
