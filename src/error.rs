//! Error taxonomy for fixture runs.

use crate::database::DbError;
use std::path::PathBuf;
use thiserror::Error;

/// The three sections of a fixture script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    Before,
    Command,
    Clear,
}

impl Section {
    pub fn from_marker(name: &str) -> Option<Self> {
        match name {
            "before" => Some(Section::Before),
            "command" => Some(Section::Command),
            "clear" => Some(Section::Clear),
            _ => None,
        }
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Section::Before => "before",
            Section::Command => "command",
            Section::Clear => "clear",
        })
    }
}

/// Failure of a single statement.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatementError {
    #[error("{receiver} has no method `{method}`")]
    UnsupportedMethod { receiver: String, method: String },

    #[error("{method}: {reason}")]
    ArgumentMismatch { method: String, reason: String },

    #[error("`{0}` is not defined")]
    UnknownVariable(String),

    #[error("result has more than {limit} documents")]
    TooManyResults { limit: usize },

    #[error(transparent)]
    Database(#[from] DbError),
}

impl StatementError {
    pub fn mismatch(method: &str, reason: impl Into<String>) -> Self {
        StatementError::ArgumentMismatch {
            method: method.to_string(),
            reason: reason.into(),
        }
    }

    /// Short, stable name of the error for canonical results.
    pub fn kind(&self) -> &str {
        match self {
            StatementError::UnsupportedMethod { .. } => "UnsupportedMethod",
            StatementError::ArgumentMismatch { .. } => "ArgumentMismatch",
            StatementError::UnknownVariable(_) => "UnknownVariable",
            StatementError::TooManyResults { .. } => "TooManyResults",
            StatementError::Database(e) => e.code_name.as_deref().unwrap_or("DatabaseError"),
        }
    }
}

/// A `clear` statement that failed; reported, never fatal.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct CleanupWarning {
    pub line: usize,
    pub statement: String,
    pub message: String,
}

impl std::fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cleanup failed at line {} (`{}`): {}",
            self.line, self.statement, self.message
        )
    }
}

/// Failure of a whole fixture. Fatal for that fixture only.
#[derive(Debug, Clone, Error)]
pub enum FixtureError {
    #[error("malformed fixture {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("setup failed at line {line} (`{statement}`): {source}")]
    SetupFailed {
        line: usize,
        statement: String,
        source: StatementError,
    },

    #[error("cancelled before the {0} section")]
    Cancelled(Section),

    #[error(transparent)]
    Connection(#[from] DbError),
}
