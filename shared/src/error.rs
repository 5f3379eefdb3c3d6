use thiserror::Error;
use uuid::Uuid;

/// What a queue consumer should do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Delete the message; redelivery would not change the outcome.
    Ack,
    /// Leave the message for redelivery after the visibility timeout.
    Retry,
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("invalid message: {0}")]
    Validation(String),

    #[error("already processed: {0}")]
    Duplicate(String),

    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient failure: {0:#}")]
    Transient(anyhow::Error),
}

impl CheckoutError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        CheckoutError::Transient(err.into())
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            CheckoutError::Transient(_) => Disposition::Retry,
            CheckoutError::Validation(_)
            | CheckoutError::Duplicate(_)
            | CheckoutError::InsufficientStock { .. }
            | CheckoutError::NotFound(_) => Disposition::Ack,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.disposition() == Disposition::Retry
    }
}

impl From<diesel::result::Error> for CheckoutError {
    fn from(err: diesel::result::Error) -> Self {
        match err {
            diesel::result::Error::NotFound => CheckoutError::NotFound("row".to_string()),
            other => CheckoutError::Transient(other.into()),
        }
    }
}

impl From<bb8::RunError<diesel_async::pooled_connection::PoolError>> for CheckoutError {
    fn from(err: bb8::RunError<diesel_async::pooled_connection::PoolError>) -> Self {
        CheckoutError::Transient(anyhow::anyhow!("database pool: {}", err))
    }
}

impl From<serde_json::Error> for CheckoutError {
    fn from(err: serde_json::Error) -> Self {
        CheckoutError::Validation(err.to_string())
    }
}

/// True when a diesel error is a unique-constraint violation.
pub fn is_unique_violation(err: &diesel::result::Error) -> bool {
    matches!(
        err,
        diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::UniqueViolation, _)
    )
}

/// Name of the unique constraint a diesel error violated, if the backend
/// reported one.
pub fn violated_unique_constraint(err: &diesel::result::Error) -> Option<&str> {
    match err {
        diesel::result::Error::DatabaseError(diesel::result::DatabaseErrorKind::UniqueViolation, info) => {
            info.constraint_name()
        }
        _ => None,
    }
}
