//! Engine error taxonomy.
//!
//! Failures fall into three classes with different handling:
//! - transient (connectivity, lock contention): retried on the next
//!   scheduling pass, no streak impact;
//! - hard (data/logic inconsistency): increments a task's failure streak
//!   and eventually escalates;
//! - invariant (the correctness contract itself is broken, e.g. a cursor
//!   regression): propagated immediately, never retried or swallowed.

use thiserror::Error;

/// The unified error type for the `bar_rollup` crate.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An error surfaced by the relational store.
    #[error("database error: {0}")]
    Db(#[from] diesel::result::Error),

    /// Failure to establish a store connection.
    #[error("connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// A programming-invariant violation. Not retryable.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// How a task failure counts against its failure streak.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailKind {
    /// Retried on the next schedule; no streak increment.
    Transient,
    /// Increments the streak; escalates at the configured threshold.
    Hard,
}

impl FailKind {
    /// Stored code for the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            FailKind::Transient => "transient",
            FailKind::Hard => "hard",
        }
    }
}

/// Classify an error for streak handling.
///
/// Returns `None` for invariant violations: those must stop the worker, not
/// feed the retry machinery.
pub fn classify(err: &EngineError) -> Option<FailKind> {
    use diesel::result::{DatabaseErrorKind, Error as DieselError};

    match err {
        EngineError::Invariant(_) => None,
        EngineError::Connection(_) => Some(FailKind::Transient),
        EngineError::Config(_) => Some(FailKind::Hard),
        EngineError::Db(db) => match db {
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _) => {
                Some(FailKind::Transient)
            }
            // SQLite lock contention surfaces as an unclassified database
            // error whose message names the lock.
            DieselError::DatabaseError(DatabaseErrorKind::Unknown, info)
                if info.message().contains("locked") || info.message().contains("busy") =>
            {
                Some(FailKind::Transient)
            }
            _ => Some(FailKind::Hard),
        },
    }
}
