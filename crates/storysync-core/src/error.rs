use std::fmt;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    ConfigInvalid,
    DocumentUnreadable,
    EntityNotFound,
    CycleDetected,
    FieldTypeMismatch,
    TransientFailure,
    RateLimited,
    AuthenticationFailed,
    PermissionDenied,
    TrackerRejected,
    TransactionRolledBack,
    RollbackIncomplete,
    ConflictUnresolved,
    StoreReadFailed,
    StoreWriteFailed,
    LockContention,
    EpicTimedOut,
    RunCancelled,
    DependencyFailed,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::ConfigInvalid => "E1002",
            Self::DocumentUnreadable => "E1003",
            Self::EntityNotFound => "E2001",
            Self::CycleDetected => "E2002",
            Self::FieldTypeMismatch => "E2003",
            Self::TransientFailure => "E3001",
            Self::RateLimited => "E3002",
            Self::AuthenticationFailed => "E3003",
            Self::PermissionDenied => "E3004",
            Self::TrackerRejected => "E3005",
            Self::TransactionRolledBack => "E4001",
            Self::RollbackIncomplete => "E4002",
            Self::ConflictUnresolved => "E4003",
            Self::StoreReadFailed => "E5001",
            Self::StoreWriteFailed => "E5002",
            Self::LockContention => "E5003",
            Self::EpicTimedOut => "E6001",
            Self::RunCancelled => "E6002",
            Self::DependencyFailed => "E6003",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::ConfigInvalid => "Config value out of range",
            Self::DocumentUnreadable => "Local document could not be read",
            Self::EntityNotFound => "Entity not found",
            Self::CycleDetected => "Dependency cycle detected",
            Self::FieldTypeMismatch => "Field value has the wrong type",
            Self::TransientFailure => "Transient tracker failure",
            Self::RateLimited => "Tracker rate limit exceeded",
            Self::AuthenticationFailed => "Tracker authentication failed",
            Self::PermissionDenied => "Tracker permission denied",
            Self::TrackerRejected => "Tracker rejected the request",
            Self::TransactionRolledBack => "Transaction rolled back",
            Self::RollbackIncomplete => "Rollback incomplete",
            Self::ConflictUnresolved => "Conflict requires manual resolution",
            Self::StoreReadFailed => "State store read failed",
            Self::StoreWriteFailed => "State store write failed",
            Self::LockContention => "Lock contention",
            Self::EpicTimedOut => "Epic sync timed out",
            Self::RunCancelled => "Sync run cancelled",
            Self::DependencyFailed => "A prerequisite epic failed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .storysync/config.toml and retry."),
            Self::ConfigInvalid => Some("Check the documented ranges for [parallel], [retry] and [rate_limit]."),
            Self::DocumentUnreadable => Some("Check the document path and format."),
            Self::EntityNotFound => None,
            Self::CycleDetected => Some("Remove/adjust dependency links to keep the graph acyclic."),
            Self::FieldTypeMismatch => None,
            Self::TransientFailure => Some("Retry the sync; the run is resumable with the same run id."),
            Self::RateLimited => Some("Lower [rate_limit] requests_per_second or retry later."),
            Self::AuthenticationFailed => Some("Refresh the tracker credentials."),
            Self::PermissionDenied => Some("Grant the sync account access to the project."),
            Self::TrackerRejected => None,
            Self::TransactionRolledBack => Some("Retry the sync; no partial changes were left behind."),
            Self::RollbackIncomplete => {
                Some("Inspect the listed operations and revert them manually in the tracker.")
            }
            Self::ConflictUnresolved => {
                Some("Pick a side per field with a resolution and run the sync again.")
            }
            Self::StoreReadFailed | Self::StoreWriteFailed => {
                Some("Check disk space and permissions of the state directory.")
            }
            Self::LockContention => Some("Retry after the other sync process releases its lock."),
            Self::EpicTimedOut => Some("Raise [parallel] epic_timeout_ms or split the epic."),
            Self::RunCancelled => None,
            Self::DependencyFailed => Some("Fix the failed prerequisite epic and run the sync again."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Any error the engine can surface at epic or run level.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Adapter(#[from] crate::adapter::AdapterError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Graph(#[from] crate::graph::GraphError),

    #[error(transparent)]
    Transaction(#[from] crate::sync::TransactionError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Lock(#[from] crate::lock::LockError),

    #[error("epic '{epic}' exceeded its {}ms timeout", timeout.as_millis())]
    EpicTimedOut {
        epic: String,
        timeout: std::time::Duration,
    },

    #[error("run cancelled")]
    Cancelled,
}

impl SyncError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Adapter(err) => err.code(),
            Self::Store(err) => err.code(),
            Self::Graph(err) => err.code(),
            Self::Transaction(err) => err.code(),
            Self::Config(err) => err.code(),
            Self::Lock(err) => err.code(),
            Self::EpicTimedOut { .. } => ErrorCode::EpicTimedOut,
            Self::Cancelled => ErrorCode::RunCancelled,
        }
    }

    /// Authentication or permission failure: nothing else in the run can
    /// succeed.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Adapter(err) => err.is_fatal(),
            _ => false,
        }
    }
}
