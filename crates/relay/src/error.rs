use std::error::Error as StdError;

use crate::{platform::PlatformError, tokens::TokenError};

/// Crate-wide result type for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed relay errors. The split between permanent and transient drives the
/// HTTP surface: permanent failures surface as 4xx and are never redelivered,
/// everything else becomes a retryable-class response so the upstream event
/// system redelivers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request payload or parameter is invalid.
    #[error("invalid relay input: {message}")]
    InvalidInput { message: String },

    /// A required proxy query parameter is absent.
    #[error("missing proxy parameters")]
    MissingParams,

    /// A capability URL or proxied file reference is past its expiry.
    #[error("capability expired")]
    Expired,

    /// Signature did not match the canonical payload.
    #[error("invalid capability signature")]
    InvalidSignature,

    /// The source platform reported no private download URL for the file.
    #[error("source file has no download URL")]
    MissingFileUrl,

    /// The source reported no size or no usable metadata for the file.
    #[error("source file metadata incomplete")]
    MissingFileMetadata,

    /// Reported size exceeds the transfer ceiling. Checked before any
    /// download is attempted.
    #[error("file of {size} bytes exceeds the {limit} byte transfer ceiling")]
    FileTooLarge { size: u64, limit: u64 },

    /// Fetching the source byte stream failed.
    #[error("source fetch failed with status {status}")]
    FileFetchFailed { status: u16 },

    /// Streaming into the destination upload slot failed.
    #[error("destination upload failed with status {status}")]
    UploadFailed { status: u16 },

    /// Capability token could not be created or transitioned.
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Chat platform call failed after exhausting retries.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// Operation is currently unavailable; worth redelivering.
    #[error("relay unavailable: {message}")]
    Unavailable { message: String },

    /// Wrapped source error from an external dependency.
    #[error("{context}: {source}")]
    External {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn external(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::External {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// True for failures the caller must not redeliver: malformed requests,
    /// failed capability checks, and resource-limit rejections.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. }
                | Self::MissingParams
                | Self::Expired
                | Self::InvalidSignature
                | Self::MissingFileMetadata
                | Self::FileTooLarge { .. }
        )
    }

    /// Wire error code for the HTTP surface.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_request",
            Self::MissingParams => "missing_params",
            Self::Expired => "expired",
            Self::InvalidSignature => "invalid_signature",
            Self::MissingFileUrl => "missing_file_url",
            Self::MissingFileMetadata => "missing_file_metadata",
            Self::FileTooLarge { .. } => "file_too_large",
            Self::FileFetchFailed { .. } => "file_fetch_failed",
            Self::UploadFailed { .. } => "upload_failed",
            Self::Token(TokenError::Unavailable) => "token_unavailable",
            Self::Token(TokenError::Store { .. }) => "server_error",
            Self::Platform(_) | Self::Unavailable { .. } | Self::External { .. } => "server_error",
        }
    }
}
