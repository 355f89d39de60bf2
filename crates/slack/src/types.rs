//! Wire types for the handful of Slack Web API methods the relay uses.

use serde::Deserialize;

/// Every Slack method wraps its payload in `{ok, error?, ...}`.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiEnvelope {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Present on `ratelimited` bodies from some methods.
    #[serde(default)]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelObject {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topic: Option<TopicObject>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TopicObject {
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConversationResponse {
    pub channel: ChannelObject,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConversationListResponse {
    #[serde(default)]
    pub channels: Vec<ChannelObject>,
    #[serde(default)]
    pub response_metadata: Option<ResponseMetadata>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResponseMetadata {
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileInfoResponse {
    #[serde(default)]
    pub file: Option<FileObject>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FileObject {
    #[serde(default)]
    pub url_private_download: Option<String>,
    #[serde(default)]
    pub url_private: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub mimetype: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UploadUrlResponse {
    pub upload_url: String,
    pub file_id: String,
}
