use thiserror::Error;

/// Broad classes of failures, used by callers to decide between retrying, reporting or aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal wiring problems: unrouted commands, duplicate handlers, unmapped events.
    Configuration,
    /// The incoming message could not be turned into a domain message.
    Translation,
    /// Business logic refused the command.
    DomainRejection,
    /// Optimistic concurrency check failed or the aggregate state changed underneath.
    Concurrency,
    /// The event log or the document store could not be reached.
    StorageUnavailable,
    /// A projector failed; the write model is not affected.
    Projection,
    /// A collaborator outside the domain logic failed, such as a context provider reading its
    /// data. Not a business refusal.
    Infrastructure,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("No handler routed for command '{command}'")]
    UnroutedCommand { command: String },

    #[error("No resolver routed for query '{query}'")]
    UnroutedQuery { query: String },

    #[error("Command '{command}' already has a handler")]
    DuplicateHandler { command: String },

    #[error("Handler of command '{command}' yielded event '{event}' which has no apply function")]
    UnmappedEvent { command: String, event: String },

    #[error("Unknown {kind} reference '{reference}'")]
    UnknownFunction { kind: &'static str, reference: String },

    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    #[error("Unrecognized message '{name}'")]
    UnrecognizedMessage { name: String },

    #[error("Failed to translate payload of '{name}': {source}")]
    MalformedPayload {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Command '{command}' carries no aggregate identifier in field '{field}'")]
    MissingAggregateIdentifier { command: String, field: String },

    #[error("Unexpected message: {0}")]
    InvalidMessage(String),

    #[error("Aggregate {aggregate_type} '{aggregate_id}' rejected command '{command}': {reason}")]
    DomainRejection {
        aggregate_type: String,
        aggregate_id: String,
        command: String,
        reason: String,
    },

    #[error("Aggregate {aggregate_type} '{aggregate_id}' already exists")]
    AggregateAlreadyExists {
        aggregate_type: String,
        aggregate_id: String,
    },

    #[error("Aggregate {aggregate_type} '{aggregate_id}' not found")]
    AggregateNotFound {
        aggregate_type: String,
        aggregate_id: String,
    },

    #[error("Concurrency conflict on {stream}/{aggregate}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        stream: String,
        aggregate: String,
        expected: u64,
        actual: u64,
    },

    #[error("Context provider '{provider}' failed for command '{command}': {source}")]
    ContextProvider {
        provider: String,
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Storage operation failed: {source}")]
    StorageUnavailable {
        #[source]
        source: anyhow::Error,
    },

    #[error("Projection '{projection}' failed on event '{event}': {source}")]
    Projection {
        projection: String,
        event: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Generic engine error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl EngineError {
    pub fn storage(source: impl Into<anyhow::Error>) -> Self {
        Self::StorageUnavailable {
            source: source.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnroutedCommand { .. }
            | Self::UnroutedQuery { .. }
            | Self::DuplicateHandler { .. }
            | Self::UnmappedEvent { .. }
            | Self::UnknownFunction { .. }
            | Self::InvalidDescription(_) => ErrorKind::Configuration,
            Self::UnrecognizedMessage { .. }
            | Self::MalformedPayload { .. }
            | Self::MissingAggregateIdentifier { .. }
            | Self::InvalidMessage(_) => ErrorKind::Translation,
            Self::DomainRejection { .. }
            | Self::AggregateAlreadyExists { .. }
            | Self::AggregateNotFound { .. } => ErrorKind::DomainRejection,
            Self::ContextProvider { .. } | Self::Generic(_) => ErrorKind::Infrastructure,
            Self::ConcurrencyConflict { .. } => ErrorKind::Concurrency,
            Self::StorageUnavailable { .. } => ErrorKind::StorageUnavailable,
            Self::Projection { .. } => ErrorKind::Projection,
        }
    }

    /// Only concurrency conflicts are worth re-running the whole load/decide/commit cycle for.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }
}

/// Reason given by domain code when it refuses a command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct Rejection {
    pub reason: String,
}

impl Rejection {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

// Result alias within the library
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_configuration_errors() {
        let err = EngineError::UnroutedCommand {
            command: "AddBuilding".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!err.is_transient());
    }

    #[test]
    fn only_conflicts_are_transient() {
        let err = EngineError::ConcurrencyConflict {
            stream: "event_stream".to_string(),
            aggregate: "Building-B1".to_string(),
            expected: 0,
            actual: 1,
        };
        assert!(err.is_transient());
        assert_eq!(
            err.to_string(),
            "Concurrency conflict on event_stream/Building-B1: expected version 0, found 1"
        );
    }

    #[test]
    fn storage_errors_keep_their_source() {
        let err = EngineError::storage(anyhow::anyhow!("disk gone"));
        assert_eq!(err.kind(), ErrorKind::StorageUnavailable);
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn failing_collaborators_are_not_domain_rejections() {
        let err = EngineError::ContextProvider {
            provider: "KnownUsers".to_string(),
            command: "CheckIn".to_string(),
            source: anyhow::anyhow!("connection reset"),
        };
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(!err.is_transient());

        let err = EngineError::from(anyhow::anyhow!("mailer down"));
        assert_eq!(err.kind(), ErrorKind::Infrastructure);

        let err = EngineError::AggregateNotFound {
            aggregate_type: "Building".to_string(),
            aggregate_id: "B1".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::DomainRejection);
    }

    #[test]
    fn rejection_displays_reason() {
        assert_eq!(Rejection::new("closed").to_string(), "closed");
    }
}
