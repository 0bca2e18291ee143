//! Trace parsing errors.

use thiserror::Error;

/// Errors raised while turning a trace into [`Operation`](crate::Operation)s.
///
/// Every variant is fatal for a run: a trace that cannot be parsed cannot be
/// trusted to define valid regions, so nothing is checked.
#[derive(Debug, Error)]
pub enum TraceError {
    /// The record could not be parsed, or region markers are not properly nested.
    #[error("malformed trace at record {record}: {reason}")]
    MalformedTrace { record: usize, reason: String },

    /// The record's tag matches no registered constructor.
    #[error("unknown operation '{tag}' at record {record}")]
    UnknownOperation { record: usize, tag: String },

    /// A configured alias points at a tag that is not registered.
    #[error("cannot alias '{alias}' to unregistered operation '{target}'")]
    UnknownAlias { alias: String, target: String },

    #[error("failed to read trace: {0}")]
    Io(#[from] std::io::Error),
}

impl TraceError {
    pub(crate) fn malformed(record: usize, reason: impl Into<String>) -> Self {
        Self::MalformedTrace {
            record,
            reason: reason.into(),
        }
    }
}
