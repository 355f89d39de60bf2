//! The chat-platform client capability consumed by the relay core.
//!
//! The relay never talks to a platform SDK directly: provisioning, message
//! posting, and file transfer all go through [`ChatClient`], and retry
//! decisions hang off [`PlatformError`]'s classification. The concrete
//! Slack implementation lives in `obridge-slack`.

use std::{error::Error as StdError, sync::Arc, time::Duration};

use {async_trait::async_trait, secrecy::Secret};

use crate::backoff::Retryable;

/// Channel metadata as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: String,
    pub name: Option<String>,
    pub topic: Option<String>,
}

/// One page of a paginated channel listing.
#[derive(Debug, Clone)]
pub struct ChannelPage {
    pub channels: Vec<ChannelInfo>,
    pub next_cursor: Option<String>,
}

/// Source-side file metadata needed to stream a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Private download URL; requires the owning workspace's bot credential.
    pub url: Option<String>,
    pub name: String,
    pub mime_type: String,
    pub size: Option<u64>,
}

/// A destination-side upload slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSlot {
    pub upload_url: String,
    pub file_id: String,
}

/// Typed platform failures, classified for the backoff executor.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// The platform API answered with an error code.
    #[error("platform api error: {code}")]
    Api {
        code: String,
        /// Server-supplied wait hint, honored verbatim by the retry loop.
        retry_after: Option<Duration>,
    },

    /// Non-success HTTP status outside the platform's error envelope.
    #[error("platform http status {status}")]
    Http { status: u16 },

    /// The request never completed.
    #[error("platform transport error: {source}")]
    Transport {
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The response decoded but made no sense.
    #[error("platform response malformed: {message}")]
    Malformed { message: String },
}

impl PlatformError {
    #[must_use]
    pub fn api(code: impl Into<String>) -> Self {
        Self::Api {
            code: code.into(),
            retry_after: None,
        }
    }

    #[must_use]
    pub fn api_with_retry_after(code: impl Into<String>, retry_after: Duration) -> Self {
        Self::Api {
            code: code.into(),
            retry_after: Some(retry_after),
        }
    }

    #[must_use]
    pub fn http(status: u16) -> Self {
        Self::Http { status }
    }

    #[must_use]
    pub fn transport(source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Transport {
            source: Box::new(source),
        }
    }

    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    /// The platform's error code, when it answered with one.
    #[must_use]
    pub fn api_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl Retryable for PlatformError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Api { code, .. } => {
                matches!(code.as_str(), "ratelimited" | "timeout" | "internal_error")
            },
            Self::Http { status } => *status == 429 || *status >= 500,
            Self::Transport { .. } | Self::Malformed { .. } => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Everything the relay needs from a chat platform, one workspace per
/// client instance.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn channel_info(&self, channel_id: &str) -> Result<ChannelInfo, PlatformError>;
    async fn create_channel(&self, name: &str) -> Result<String, PlatformError>;
    async fn set_channel_topic(&self, channel_id: &str, topic: &str)
    -> Result<(), PlatformError>;
    async fn join_channel(&self, channel_id: &str) -> Result<(), PlatformError>;
    async fn list_channels(&self, cursor: Option<&str>) -> Result<ChannelPage, PlatformError>;
    async fn post_message(&self, channel_id: &str, text: &str) -> Result<(), PlatformError>;
    async fn file_info(&self, file_id: &str) -> Result<FileMetadata, PlatformError>;
    async fn request_upload(&self, filename: &str, length: u64)
    -> Result<UploadSlot, PlatformError>;
    async fn complete_upload(
        &self,
        file_id: &str,
        title: &str,
        channel_id: &str,
    ) -> Result<(), PlatformError>;
}

/// Builds a [`ChatClient`] for an arbitrary bot credential. Used by the
/// direct-transfer path, which authenticates against the *source* workspace.
pub trait ChatClientFactory: Send + Sync {
    fn with_token(&self, token: Secret<String>) -> Arc<dyn ChatClient>;
}

/// External installation store: bot credentials recorded per workspace.
#[async_trait]
pub trait InstallationStore: Send + Sync {
    async fn bot_token(&self, workspace: &str) -> Result<Option<Secret<String>>, PlatformError>;
}

/// In-memory installation store for single-process deployments and tests.
#[derive(Default)]
pub struct MemoryInstallationStore {
    tokens: dashmap::DashMap<String, Secret<String>>,
}

impl MemoryInstallationStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, workspace: impl Into<String>, token: Secret<String>) {
        self.tokens.insert(workspace.into(), token);
    }
}

#[async_trait]
impl InstallationStore for MemoryInstallationStore {
    async fn bot_token(&self, workspace: &str) -> Result<Option<Secret<String>>, PlatformError> {
        Ok(self.tokens.get(workspace).map(|entry| entry.clone()))
    }
}
