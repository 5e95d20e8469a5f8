//! Errors - processor エラーと分類

use std::fmt;

use serde::{Deserialize, Serialize};

/// ErrorKind は processor エラーの分類
///
/// - Transient: 一時的なエラー（リトライ対象）
/// - Permanent: 恒久的なエラー（リトライしても無意味、即 Failed）
///
/// 何も指定しなければ Transient 扱い。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[default]
    Transient,
    Permanent,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => f.write_str("transient"),
            ErrorKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// Error returned by a [`Processor`](crate::queue::Processor) for one item.
///
/// ```
/// use batchq_core::{ErrorKind, ProcessError};
///
/// let err: ProcessError = "lookup timed out".into();
/// assert_eq!(err.kind(), ErrorKind::Transient);
///
/// let err = ProcessError::permanent("address not found");
/// assert!(!err.is_retriable());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ProcessError {
    kind: ErrorKind,
    message: String,
}

impl ProcessError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retriable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl From<String> for ProcessError {
    fn from(message: String) -> Self {
        Self::transient(message)
    }
}

impl From<&str> for ProcessError {
    fn from(message: &str) -> Self {
        Self::transient(message)
    }
}
