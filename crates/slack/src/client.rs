use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::de::DeserializeOwned,
    tracing::debug,
};

use obridge_relay::platform::{
    ChannelInfo, ChannelPage, ChatClient, ChatClientFactory, FileMetadata, PlatformError,
    UploadSlot,
};

use crate::types::{
    ApiEnvelope, ConversationListResponse, ConversationResponse, FileInfoResponse,
    UploadUrlResponse,
};

const DEFAULT_BASE_URL: &str = "https://slack.com/api";
const LIST_PAGE_SIZE: u32 = 200;

/// Minimal Slack Web API client for one workspace's bot credential.
pub struct SlackClient {
    http: reqwest::Client,
    token: Secret<String>,
    base_url: String,
}

impl SlackClient {
    #[must_use]
    pub fn new(token: Secret<String>) -> Self {
        Self::with_base_url(token, DEFAULT_BASE_URL)
    }

    /// Point the client at a different API root. Tests use this to talk to
    /// a local mock server.
    #[must_use]
    pub fn with_base_url(token: Secret<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
            base_url: base_url.into(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url.trim_end_matches('/'))
    }

    /// POST a JSON-arguments method and decode its payload.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        args: serde_json::Value,
    ) -> Result<T, PlatformError> {
        let request = self
            .http
            .post(self.method_url(method))
            .bearer_auth(self.token.expose_secret())
            .json(&args);
        self.execute(method, request).await
    }

    /// POST a form-arguments method. The external-upload endpoints reject
    /// JSON bodies.
    async fn call_form<T: DeserializeOwned>(
        &self,
        method: &str,
        args: &[(&str, String)],
    ) -> Result<T, PlatformError> {
        let request = self
            .http
            .post(self.method_url(method))
            .bearer_auth(self.token.expose_secret())
            .form(args);
        self.execute(method, request).await
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        method: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, PlatformError> {
        let response = request.send().await.map_err(PlatformError::transport)?;
        let status = response.status();

        // Slack signals rate limiting at the HTTP layer with a Retry-After
        // header; map it onto the api-code classification the retry loop
        // understands.
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(match retry_after {
                Some(wait) => PlatformError::api_with_retry_after("ratelimited", wait),
                None => PlatformError::api("ratelimited"),
            });
        }
        if !status.is_success() {
            return Err(PlatformError::http(status.as_u16()));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PlatformError::malformed(format!("{method}: {e}")))?;
        let envelope: ApiEnvelope = serde_json::from_value(body.clone())
            .map_err(|e| PlatformError::malformed(format!("{method}: {e}")))?;
        if !envelope.ok {
            let code = envelope.error.unwrap_or_else(|| "unknown_error".into());
            debug!(method, code = %code, "slack api call failed");
            return Err(match envelope.retry_after {
                Some(secs) => {
                    PlatformError::api_with_retry_after(code, Duration::from_secs(secs))
                },
                None => PlatformError::api(code),
            });
        }
        serde_json::from_value(body)
            .map_err(|e| PlatformError::malformed(format!("{method}: {e}")))
    }
}

#[async_trait]
impl ChatClient for SlackClient {
    async fn channel_info(&self, channel_id: &str) -> Result<ChannelInfo, PlatformError> {
        let response: ConversationResponse = self
            .call(
                "conversations.info",
                serde_json::json!({ "channel": channel_id }),
            )
            .await?;
        Ok(ChannelInfo {
            id: response.channel.id,
            name: response.channel.name,
            topic: response.channel.topic.and_then(|topic| topic.value),
        })
    }

    async fn create_channel(&self, name: &str) -> Result<String, PlatformError> {
        let response: ConversationResponse = self
            .call("conversations.create", serde_json::json!({ "name": name }))
            .await?;
        Ok(response.channel.id)
    }

    async fn set_channel_topic(
        &self,
        channel_id: &str,
        topic: &str,
    ) -> Result<(), PlatformError> {
        self.call::<serde_json::Value>(
            "conversations.setTopic",
            serde_json::json!({ "channel": channel_id, "topic": topic }),
        )
        .await
        .map(|_| ())
    }

    async fn join_channel(&self, channel_id: &str) -> Result<(), PlatformError> {
        self.call::<serde_json::Value>(
            "conversations.join",
            serde_json::json!({ "channel": channel_id }),
        )
        .await
        .map(|_| ())
    }

    async fn list_channels(&self, cursor: Option<&str>) -> Result<ChannelPage, PlatformError> {
        let mut args = serde_json::json!({
            "limit": LIST_PAGE_SIZE,
            "exclude_archived": true,
            "types": "public_channel",
        });
        if let Some(cursor) = cursor
            && let Some(object) = args.as_object_mut()
        {
            object.insert("cursor".into(), serde_json::Value::String(cursor.into()));
        }
        let response: ConversationListResponse =
            self.call("conversations.list", args).await?;
        Ok(ChannelPage {
            channels: response
                .channels
                .into_iter()
                .map(|channel| ChannelInfo {
                    id: channel.id,
                    name: channel.name,
                    topic: channel.topic.and_then(|topic| topic.value),
                })
                .collect(),
            next_cursor: response
                .response_metadata
                .and_then(|metadata| metadata.next_cursor)
                .filter(|cursor| !cursor.is_empty()),
        })
    }

    async fn post_message(&self, channel_id: &str, text: &str) -> Result<(), PlatformError> {
        self.call::<serde_json::Value>(
            "chat.postMessage",
            serde_json::json!({ "channel": channel_id, "text": text }),
        )
        .await
        .map(|_| ())
    }

    async fn file_info(&self, file_id: &str) -> Result<FileMetadata, PlatformError> {
        let response: FileInfoResponse = self
            .call("files.info", serde_json::json!({ "file": file_id }))
            .await?;
        let Some(file) = response.file else {
            return Err(PlatformError::api("file_not_found"));
        };
        Ok(FileMetadata {
            url: file.url_private_download.or(file.url_private),
            name: file.name.unwrap_or_else(|| "file".into()),
            mime_type: file
                .mimetype
                .unwrap_or_else(|| "application/octet-stream".into()),
            size: file.size,
        })
    }

    async fn request_upload(
        &self,
        filename: &str,
        length: u64,
    ) -> Result<UploadSlot, PlatformError> {
        let response: UploadUrlResponse = self
            .call_form(
                "files.getUploadURLExternal",
                &[
                    ("filename", filename.to_string()),
                    ("length", length.to_string()),
                ],
            )
            .await?;
        Ok(UploadSlot {
            upload_url: response.upload_url,
            file_id: response.file_id,
        })
    }

    async fn complete_upload(
        &self,
        file_id: &str,
        title: &str,
        channel_id: &str,
    ) -> Result<(), PlatformError> {
        self.call::<serde_json::Value>(
            "files.completeUploadExternal",
            serde_json::json!({
                "files": [{ "id": file_id, "title": title }],
                "channel_id": channel_id,
            }),
        )
        .await
        .map(|_| ())
    }
}

/// Builds [`SlackClient`]s for arbitrary bot credentials against the same
/// API root. Used by the direct-transfer path.
pub struct SlackClientFactory {
    base_url: String,
}

impl SlackClientFactory {
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
        }
    }

    #[must_use]
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

impl Default for SlackClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatClientFactory for SlackClientFactory {
    fn with_token(&self, token: Secret<String>) -> Arc<dyn ChatClient> {
        Arc::new(SlackClient::with_base_url(token, self.base_url.clone()))
    }
}
