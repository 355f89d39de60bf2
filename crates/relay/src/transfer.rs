//! Streaming file transfer between two independently-authenticated
//! workspaces.
//!
//! Both transports, capability-URL proxy fetch and direct credentialed
//! fetch, feed the same three-step upload: resolve a source byte stream,
//! request a destination upload slot, pipe the stream into the slot and
//! complete the upload. The body is never buffered in full; destination
//! write pressure throttles the source read.

use std::sync::Arc;

use {secrecy::ExposeSecret, tracing::info};

use obridge_common::{RelayFile, RelayFileSource};

use crate::{
    backoff::{RetryPolicy, retry_with_backoff},
    clock::now_epoch_ms,
    error::{Error, Result},
    platform::{ChatClient, ChatClientFactory, InstallationStore, PlatformError},
};

/// Hard ceiling on relayed attachments. Checked against every reported
/// size before any download is attempted; never retried.
pub const MAX_RELAY_FILE_BYTES: u64 = 200 * 1024 * 1024;

/// A resolved source ready to stream.
struct SourceStream {
    response: reqwest::Response,
    name: String,
    mime_type: String,
    size: u64,
}

pub struct FileTransferPipeline {
    http: reqwest::Client,
    destination: Arc<dyn ChatClient>,
    installations: Arc<dyn InstallationStore>,
    clients: Arc<dyn ChatClientFactory>,
    policy: RetryPolicy,
}

impl FileTransferPipeline {
    pub fn new(
        http: reqwest::Client,
        destination: Arc<dyn ChatClient>,
        installations: Arc<dyn InstallationStore>,
        clients: Arc<dyn ChatClientFactory>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            http,
            destination,
            installations,
            clients,
            policy,
        }
    }

    /// Move one attachment into `channel_id`. Any stage failure aborts the
    /// whole transfer; the caller decides whether to retry it end to end.
    pub async fn transfer(&self, file: &RelayFile, channel_id: &str) -> Result<()> {
        // Fail fast on any size we already know, before touching the network.
        if let Some(size) = file.size {
            guard_size(size)?;
        }

        let source = match &file.source {
            RelayFileSource::Proxy {
                proxy_url,
                expires_at,
            } => {
                self.resolve_proxy_source(file, proxy_url, *expires_at)
                    .await?
            },
            RelayFileSource::Direct {
                source_file_id,
                source_workspace,
            } => {
                self.resolve_direct_source(source_file_id, source_workspace)
                    .await?
            },
        };

        let slot = retry_with_backoff(&self.policy, || {
            self.destination.request_upload(&source.name, source.size)
        })
        .await?;

        let upload_status = self
            .http
            .post(&slot.upload_url)
            .header(reqwest::header::CONTENT_TYPE, source.mime_type.clone())
            .header(reqwest::header::CONTENT_LENGTH, source.size)
            .body(reqwest::Body::wrap_stream(source.response.bytes_stream()))
            .send()
            .await
            .map_err(|e| Error::external("stream upload", e))?
            .status();
        if !upload_status.is_success() {
            return Err(Error::UploadFailed {
                status: upload_status.as_u16(),
            });
        }

        retry_with_backoff(&self.policy, || {
            self.destination
                .complete_upload(&slot.file_id, &source.name, channel_id)
        })
        .await?;

        info!(
            channel_id,
            filename = %source.name,
            size = source.size,
            "relayed file into destination channel"
        );
        Ok(())
    }

    /// Capability-URL transport: the sender's proxy streams the bytes; the
    /// URL itself is the credential. Fetched once: the token behind it is
    /// single-use, so a retried GET could only fail the claim.
    async fn resolve_proxy_source(
        &self,
        file: &RelayFile,
        proxy_url: &str,
        expires_at: i64,
    ) -> Result<SourceStream> {
        if now_epoch_ms() > expires_at {
            return Err(Error::Expired);
        }
        let Some(size) = file.size else {
            return Err(Error::MissingFileMetadata);
        };
        guard_size(size)?;

        let response = self
            .http
            .get(proxy_url)
            .send()
            .await
            .map_err(|e| Error::external("proxy fetch", e))?;
        if !response.status().is_success() {
            return Err(Error::FileFetchFailed {
                status: response.status().as_u16(),
            });
        }

        Ok(SourceStream {
            response,
            name: file.filename.clone().unwrap_or_else(|| "file".into()),
            mime_type: file
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".into()),
            size,
        })
    }

    /// Direct transport: authenticate against the source workspace with its
    /// own bot credential from the installation store.
    async fn resolve_direct_source(
        &self,
        file_id: &str,
        workspace: &str,
    ) -> Result<SourceStream> {
        let token = self
            .installations
            .bot_token(workspace)
            .await?
            .ok_or_else(|| {
                Error::invalid_input(format!("no installation recorded for {workspace}"))
            })?;
        let source_client = self.clients.with_token(token.clone());

        let meta = retry_with_backoff(&self.policy, || source_client.file_info(file_id)).await?;
        let Some(url) = meta.url.filter(|url| !url.is_empty()) else {
            return Err(Error::MissingFileUrl);
        };
        let Some(size) = meta.size else {
            return Err(Error::MissingFileMetadata);
        };
        guard_size(size)?;

        let response = retry_with_backoff(&self.policy, || {
            let url = url.clone();
            let token = token.clone();
            async move {
                let response = self
                    .http
                    .get(&url)
                    .bearer_auth(token.expose_secret())
                    .send()
                    .await
                    .map_err(PlatformError::transport)?;
                if !response.status().is_success() {
                    return Err(PlatformError::http(response.status().as_u16()));
                }
                Ok(response)
            }
        })
        .await?;

        Ok(SourceStream {
            response,
            name: meta.name,
            mime_type: meta.mime_type,
            size,
        })
    }
}

fn guard_size(size: u64) -> Result<()> {
    if size > MAX_RELAY_FILE_BYTES {
        return Err(Error::FileTooLarge {
            size,
            limit: MAX_RELAY_FILE_BYTES,
        });
    }
    Ok(())
}
