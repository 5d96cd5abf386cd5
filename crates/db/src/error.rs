use widgetry_core::error::CoreError;

/// Errors raised by the key-value layer and the repositories built on it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend could not be reached or failed internally.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A round trip exceeded its deadline.
    #[error("Store call timed out")]
    Timeout,

    /// The caller's context was cancelled.
    #[error("Store call cancelled")]
    Cancelled,

    /// A transaction touched keys in more than one hash slot.
    #[error("Transaction keys span multiple hash slots: {0:?}")]
    CrossSlot(Vec<String>),

    #[error("Wrong value type at key {key}")]
    WrongType { key: String },

    #[error("Invalid value at key {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    /// One pipelined command failed.
    #[error("Command failed: {0}")]
    Command(String),

    #[error("Unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply { expected: &'static str, got: String },

    #[error("Failed to decode {entity}: {reason}")]
    Decode { entity: &'static str, reason: String },

    /// An optimistic write lost to a concurrent writer too many times, or a
    /// create collided with an existing record.
    #[error("Write conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Connectivity-class failures that callers may retry at their own level.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout | StoreError::Cancelled
        )
    }
}

/// Error type returned by [`WidgetService`](crate::service::WidgetService).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A domain-level error (not found, validation, conflict, ownership).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A store failure that has no domain meaning.
    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(msg) => ServiceError::Core(CoreError::Conflict(msg)),
            other => ServiceError::Store(other),
        }
    }
}

/// Convenience alias for service return values.
pub type ServiceResult<T> = Result<T, ServiceError>;
