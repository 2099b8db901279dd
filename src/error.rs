//! Error types for pgtext.

use thiserror::Error;

/// Result type for pgtext operations.
pub type Result<T> = core::result::Result<T, Error>;

/// A decoded ErrorResponse (or NoticeResponse) from the server.
///
/// Field meanings follow the PostgreSQL error/notice field protocol.
#[derive(Debug, Clone, Default)]
pub struct ServerError {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
    /// Source file name
    pub file: Option<String>,
    /// Source line number
    pub line: Option<u32>,
    /// Source routine name
    pub routine: Option<String>,
}

impl ServerError {
    /// Build a ServerError from raw (field-type byte, value) pairs.
    pub(crate) fn from_fields<'a, I>(fields: I) -> Self
    where
        I: Iterator<Item = (u8, &'a str)>,
    {
        let mut err = ServerError::default();
        for (field_type, value) in fields {
            match field_type {
                b'S' => err.severity = Some(value.to_string()),
                b'C' => err.code = Some(value.to_string()),
                b'M' => err.message = Some(value.to_string()),
                b'D' => err.detail = Some(value.to_string()),
                b'H' => err.hint = Some(value.to_string()),
                b'P' => err.position = value.parse().ok(),
                b'W' => err.where_ = Some(value.to_string()),
                b's' => err.schema = Some(value.to_string()),
                b't' => err.table = Some(value.to_string()),
                b'c' => err.column = Some(value.to_string()),
                b'n' => err.constraint = Some(value.to_string()),
                b'F' => err.file = Some(value.to_string()),
                b'L' => err.line = value.parse().ok(),
                b'R' => err.routine = Some(value.to_string()),
                _ => {}
            }
        }
        err
    }

    /// SQLSTATE code, if the server sent one.
    pub fn sqlstate(&self) -> Option<&str> {
        self.code.as_deref()
    }

    /// True if the SQLSTATE is in class 23 (integrity constraint violation).
    pub fn is_integrity(&self) -> bool {
        matches!(self.code.as_deref(), Some(code) if code.starts_with("23"))
    }

    /// True if the severity indicates the connection is unusable afterwards.
    pub fn is_fatal(&self) -> bool {
        matches!(self.severity.as_deref(), Some("FATAL") | Some("PANIC"))
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for pgtext.
#[derive(Debug, Error)]
pub enum Error {
    /// Server error response
    #[error("PostgreSQL error: {0}")]
    Server(ServerError),

    /// Server error response with a class-23 SQLSTATE (integrity violation)
    #[error("PostgreSQL integrity violation: {0}")]
    Integrity(ServerError),

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed the connection mid-message
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// TLS error
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// The pool has been closed
    #[error("Pool is closed")]
    PoolClosed,

    /// Timed out waiting for a pool connection
    #[error("Timed out waiting for a pool connection")]
    PoolTimeout,

    /// A *_one operation matched zero rows
    #[error("No rows in result set")]
    NoRows,

    /// A *_one operation matched more than one row
    #[error("Multiple rows in result set")]
    MultiRows,

    /// Parameter encoding failed before any wire I/O
    #[error("Encode error: {0}")]
    Encode(String),

    /// Column decoding failed
    #[error("Decode error: {0}")]
    Decode(String),

    /// Invalid API usage (e.g. executing a closed statement)
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),
}

impl From<std::convert::Infallible> for Error {
    fn from(value: std::convert::Infallible) -> Self {
        match value {}
    }
}

impl Error {
    /// Wrap a decoded ErrorResponse, distinguishing integrity violations.
    pub(crate) fn from_server(err: ServerError) -> Self {
        if err.is_integrity() {
            Error::Integrity(err)
        } else {
            Error::Server(err)
        }
    }

    /// Returns true if the error means the connection cannot be reused.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectionClosed | Error::Protocol(_) | Error::Auth(_) => true,
            #[cfg(feature = "tls")]
            Error::Tls(_) => true,
            Error::Server(fields) | Error::Integrity(fields) => fields.is_fatal(),
            _ => false,
        }
    }

    /// The decoded server error, if this error originated from an ErrorResponse.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Error::Server(fields) | Error::Integrity(fields) => Some(fields),
            _ => None,
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        self.server_error().and_then(|f| f.code.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(code: &str) -> ServerError {
        ServerError {
            severity: Some("ERROR".into()),
            code: Some(code.into()),
            message: Some("boom".into()),
            ..Default::default()
        }
    }

    #[test]
    fn integrity_class() {
        assert!(server_error("23505").is_integrity());
        assert!(server_error("23000").is_integrity());
        assert!(!server_error("42601").is_integrity());
        assert!(!ServerError::default().is_integrity());
    }

    #[test]
    fn from_server_distinguishes_integrity() {
        assert!(matches!(
            Error::from_server(server_error("23505")),
            Error::Integrity(_)
        ));
        assert!(matches!(
            Error::from_server(server_error("42601")),
            Error::Server(_)
        ));
    }

    #[test]
    fn fatal_severities() {
        let mut err = server_error("57P01");
        err.severity = Some("FATAL".into());
        assert!(Error::from_server(err).is_fatal());
        assert!(!Error::from_server(server_error("42601")).is_fatal());
        assert!(Error::ConnectionClosed.is_fatal());
        assert!(!Error::NoRows.is_fatal());
    }

    #[test]
    fn field_parsing() {
        let fields = [
            (b'S', "ERROR"),
            (b'C', "23505"),
            (b'M', "duplicate key"),
            (b'D', "Key (id)=(1) already exists."),
            (b'P', "12"),
            (b'n', "users_pkey"),
        ];
        let err = ServerError::from_fields(fields.into_iter());
        assert_eq!(err.severity.as_deref(), Some("ERROR"));
        assert_eq!(err.code.as_deref(), Some("23505"));
        assert_eq!(err.position, Some(12));
        assert_eq!(err.constraint.as_deref(), Some("users_pkey"));
        assert!(err.is_integrity());
    }
}
