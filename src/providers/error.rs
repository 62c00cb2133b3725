/// Provider-specific error with retry classification.
///
/// The runtime uses [`ProviderError::is_retryable`] to decide whether to nack
/// and retry a work item, and [`ProviderError::is_version_conflict`] to decide
/// whether to re-read history and replay.
///
/// ```rust,no_run
/// use duroflow::providers::ProviderError;
///
/// # fn example() -> Result<(), ProviderError> {
/// return Err(ProviderError::retryable("append", "store is busy"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed ({kind:?}): {message}")]
pub struct ProviderError {
    /// Operation that failed (e.g. "append", "dequeue_with_lease")
    pub operation: String,
    pub message: String,
    pub kind: ProviderErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Transient; the same call may succeed later.
    Retryable,
    Permanent,
    /// Conditional append saw a different history length than expected.
    VersionConflict,
    AlreadyExists,
    NotFound,
}

impl ProviderError {
    fn new(kind: ProviderErrorKind, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind,
        }
    }

    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Retryable, operation, message)
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Permanent, operation, message)
    }

    pub fn version_conflict(operation: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::new(
            ProviderErrorKind::VersionConflict,
            operation,
            format!("expected version {expected}, found {actual}"),
        )
    }

    pub fn already_exists(operation: impl Into<String>, instance: &str) -> Self {
        Self::new(
            ProviderErrorKind::AlreadyExists,
            operation,
            format!("instance already exists: {instance}"),
        )
    }

    pub fn not_found(operation: impl Into<String>, what: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::NotFound, operation, what)
    }

    /// Conflicts are retryable too, but through re-read and replay rather
    /// than a blind retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Retryable | ProviderErrorKind::VersionConflict
        )
    }

    pub fn is_version_conflict(&self) -> bool {
        self.kind == ProviderErrorKind::VersionConflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind == ProviderErrorKind::AlreadyExists
    }

    /// Convert to the history-level error taxonomy.
    pub fn to_error_details(&self) -> crate::ErrorDetails {
        crate::ErrorDetails::Infrastructure {
            operation: self.operation.clone(),
            message: self.message.clone(),
            retryable: self.is_retryable(),
        }
    }
}
