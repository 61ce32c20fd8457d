//! Error types for the catalog core library.

use std::path::PathBuf;

/// The main error type for catalog operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The appliance is not a readable tar stream.
    #[error("not an OVA archive: {message}")]
    NotArchive { message: String },

    /// The archive holds no `.ovf` descriptor.
    #[error("no OVF descriptor found in archive")]
    NoDescriptor,

    /// The descriptor is not well-formed XML or has no envelope.
    #[error("malformed OVF descriptor: {message}")]
    MalformedXml { message: String },

    /// The archive or descriptor ended early.
    #[error("truncated appliance: {message}")]
    Truncated { message: String },

    /// The file does not carry the VHDX signature.
    #[error("not a VHDX file")]
    NotVhdx,

    /// A VHDX structure failed validation.
    #[error("corrupt VHDX: {message}")]
    Corrupt { message: String },

    /// A required VHDX region or metadata item is absent.
    #[error("missing VHDX metadata: {message}")]
    MissingMetadata { message: String },

    /// Error generating an OVF descriptor.
    #[error("OVF error: {message}")]
    Ovf { message: String },

    /// A record could not be encoded for identifier derivation.
    #[error("encoding error: {message}")]
    Encoding { message: String },

    /// The operation observed a cancellation request.
    #[error("operation cancelled")]
    Cancelled,
}

/// A specialized Result type for catalog operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a not-an-archive error.
    pub fn not_archive(message: impl Into<String>) -> Self {
        Self::NotArchive {
            message: message.into(),
        }
    }

    /// Create a malformed XML error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedXml {
            message: message.into(),
        }
    }

    /// Create a truncation error.
    pub fn truncated(message: impl Into<String>) -> Self {
        Self::Truncated {
            message: message.into(),
        }
    }

    /// Create a corrupt VHDX error.
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Create a missing VHDX metadata error.
    pub fn missing_metadata(message: impl Into<String>) -> Self {
        Self::MissingMetadata {
            message: message.into(),
        }
    }

    /// Create an OVF error.
    pub fn ovf(message: impl Into<String>) -> Self {
        Self::Ovf {
            message: message.into(),
        }
    }

    /// Create an encoding error.
    pub fn encoding(message: impl Into<String>) -> Self {
        Self::Encoding {
            message: message.into(),
        }
    }

    /// Whether this error describes the appliance content rather than the
    /// environment it was read from.
    pub fn is_content_error(&self) -> bool {
        matches!(
            self,
            Error::NotArchive { .. }
                | Error::NoDescriptor
                | Error::MalformedXml { .. }
                | Error::Truncated { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
