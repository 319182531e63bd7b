use thiserror::Error;

/// Unified error type for the entire coordination engine
#[derive(Debug, Error)]
pub enum FanoutError {
    /// Malformed task or footprint; rejected before planning
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The ownership assigner cannot isolate a task's resources
    #[error("Ownership conflict for task {task_id}: {reason}")]
    OwnershipConflict { task_id: String, reason: String },

    /// Duplicate resource write detected during the parallel phase
    #[error("Resource integrity violation at {address}: {details}")]
    ResourceIntegrity { address: String, details: String },

    /// Consumption passed the hard budget cap (allocation + one extension)
    #[error("Budget exceeded for task {task_id}: consumed {consumed} of {allocated} allocated")]
    BudgetExceeded {
        task_id: String,
        allocated: u64,
        consumed: u64,
    },

    /// Worker or operation timed out
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Worker stopped updating its progress marker while still running
    #[error("Worker {worker_id} is stuck (no progress for {idle_ms}ms)")]
    StuckWorker { worker_id: String, idle_ms: u64 },

    /// Proposed state failed pre-write validation; prior state preserved
    #[error("State corruption detected: {message}")]
    StateCorruption { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Database/persistence errors
    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Cooperative cancellation
    #[error("Operation was cancelled: {operation}")]
    Cancelled {
        operation: String,
        reason: Option<String>,
    },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl FanoutError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error with the offending field
    pub fn validation_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create an ownership conflict error
    pub fn ownership_conflict<S: Into<String>, R: Into<String>>(task_id: S, reason: R) -> Self {
        Self::OwnershipConflict {
            task_id: task_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a resource integrity error
    pub fn resource_integrity<S: Into<String>, D: Into<String>>(address: S, details: D) -> Self {
        Self::ResourceIntegrity {
            address: address.into(),
            details: details.into(),
        }
    }

    /// Create a budget exceeded error
    pub fn budget_exceeded<S: Into<String>>(task_id: S, allocated: u64, consumed: u64) -> Self {
        Self::BudgetExceeded {
            task_id: task_id.into(),
            allocated,
            consumed,
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a stuck worker error
    pub fn stuck_worker<S: Into<String>>(worker_id: S, idle_ms: u64) -> Self {
        Self::StuckWorker {
            worker_id: worker_id.into(),
            idle_ms,
        }
    }

    /// Create a state corruption error
    pub fn state_corruption<S: Into<String>>(message: S) -> Self {
        Self::StateCorruption {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a database error
    pub fn database<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a cancellation error
    pub fn cancelled<S: Into<String>>(operation: S) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: None,
        }
    }

    /// Create a cancellation error with a reason
    pub fn cancelled_because<S: Into<String>, R: Into<String>>(operation: S, reason: R) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            reason: Some(reason.into()),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if the error is recoverable through the retry-once policy.
    ///
    /// Task-level failures (timeout, stuck, budget) degrade gracefully;
    /// planning and integrity failures must never be silently retried.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::StuckWorker { .. } => true,
            Self::BudgetExceeded { .. } => true, // degrades to partial, never blocks siblings
            Self::Database { .. } | Self::Io { .. } => true,
            Self::Validation { .. } | Self::OwnershipConflict { .. } => false,
            Self::ResourceIntegrity { .. } | Self::StateCorruption { .. } => false,
            Self::Configuration { .. } | Self::Cancelled { .. } => false,
            _ => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "validation",
            Self::OwnershipConflict { .. } => "ownership",
            Self::ResourceIntegrity { .. } => "integrity",
            Self::BudgetExceeded { .. } => "budget",
            Self::Timeout { .. } => "timeout",
            Self::StuckWorker { .. } => "stuck",
            Self::StateCorruption { .. } => "state",
            Self::Configuration { .. } => "configuration",
            Self::Database { .. } => "database",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Cancelled { .. } => "cancelled",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, FanoutError>;

/// Convert from common error types
impl From<std::io::Error> for FanoutError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for FanoutError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<sled::Error> for FanoutError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled_operation", err)
    }
}

impl From<anyhow::Error> for FanoutError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{err:#}"))
    }
}
