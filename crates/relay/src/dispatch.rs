//! End-to-end relay flows.
//!
//! Inbound: one envelope from the peer workspace becomes committed side
//! effects: channel ensured, text posted, files transferred. Outbound: one
//! platform message event in this workspace becomes an envelope carrying
//! capability-URL-wrapped files, enqueued and POSTed to the peer.

use std::sync::Arc;

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    tracing::{info, warn},
};

use obridge_common::{
    RelayDirection, RelayEnvelope, RelayFile, RelayFileSource, build_relay_key,
};

use crate::{
    backoff::{RetryPolicy, retry_with_backoff},
    capability::{PROXY_URL_TTL, ProxyFileGrant, issue_proxy_file},
    error::{Error, Result},
    limiter::{RateLimitConfig, RateLimiterRegistry},
    platform::{ChatClient, PlatformError},
    provision::{ChannelProvisioner, is_relay_channel, parse_routing_key},
    tokens::TokenStore,
    transfer::FileTransferPipeline,
};

/// Inbound traffic budget per tenant: a burst of five envelopes, refilling
/// at five per second.
pub const INBOUND_LIMIT: RateLimitConfig = RateLimitConfig {
    capacity: 5.0,
    refill_per_ms: 5.0 / 1000.0,
};

/// How many wait-and-retake rounds an inbound request will sit out before
/// giving up with a retryable error.
const MAX_LIMITER_ROUNDS: u32 = 5;

/// Body of `POST /relay/inbound`. Identification fields default to empty so
/// their absence surfaces as a relay-level validation error rather than a
/// deserialization failure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRelayRequest {
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub files: Vec<RelayFile>,
    #[serde(default)]
    pub relay_key: Option<String>,
}

/// Inbound side: turns one relay request into platform side effects.
pub struct RelayDispatcher {
    client: Arc<dyn ChatClient>,
    provisioner: ChannelProvisioner,
    transfers: FileTransferPipeline,
    limiters: Arc<RateLimiterRegistry>,
    policy: RetryPolicy,
}

impl RelayDispatcher {
    pub fn new(
        client: Arc<dyn ChatClient>,
        provisioner: ChannelProvisioner,
        transfers: FileTransferPipeline,
        limiters: Arc<RateLimiterRegistry>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            provisioner,
            transfers,
            limiters,
            policy,
        }
    }

    /// Handle one authenticated inbound request. Returns a permanent error
    /// for malformed input; any other failure is retryable and the caller
    /// should answer with a redeliverable status.
    pub async fn handle_inbound(&self, request: InboundRelayRequest) -> Result<()> {
        if request.team_id.is_empty() || request.user_id.is_empty() {
            return Err(Error::invalid_input("missing team or user"));
        }

        self.throttle(&format!("relay-in:{}", request.team_id))
            .await?;

        let channel_id = self
            .provisioner
            .ensure_channel(&request.team_id, &request.user_id)
            .await?;

        if let Some(text) = request.text.as_deref().filter(|text| !text.is_empty()) {
            retry_with_backoff(&self.policy, || {
                self.client.post_message(&channel_id, text)
            })
            .await?;
        }

        for file in &request.files {
            self.transfers.transfer(file, &channel_id).await?;
        }

        info!(
            team_id = %request.team_id,
            user_id = %request.user_id,
            relay_key = ?request.relay_key,
            files = request.files.len(),
            "inbound relay delivered"
        );
        Ok(())
    }

    /// Wait out the tenant's token bucket. The bucket reserves nothing, so
    /// readiness is re-derived with a fresh `take` after each sleep.
    async fn throttle(&self, key: &str) -> Result<()> {
        for _ in 0..MAX_LIMITER_ROUNDS {
            let wait_ms = self.limiters.take(key, INBOUND_LIMIT, 1.0);
            if wait_ms == 0 {
                return Ok(());
            }
            if wait_ms == u64::MAX {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
        }
        Err(Error::unavailable(format!("tenant {key} is rate limited")))
    }
}

/// A message event observed in this workspace, as handed over by the event
/// subscription framework.
#[derive(Debug, Clone)]
pub struct ChannelMessageEvent {
    pub channel_id: String,
    pub user: Option<String>,
    pub bot_id: Option<String>,
    pub subtype: Option<String>,
    pub text: Option<String>,
    pub files: Vec<MessageFile>,
    pub event_id: Option<String>,
    /// Platform message timestamp, the event-id fallback.
    pub ts: String,
}

#[derive(Debug, Clone)]
pub struct MessageFile {
    pub id: String,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

impl ChannelMessageEvent {
    /// Only plain user messages relay: no bot echoes (loop protection), no
    /// edits or deletes. `file_share` is the one subtype carrying content.
    #[must_use]
    pub fn is_user_message(&self) -> bool {
        self.bot_id.is_none()
            && self.user.is_some()
            && self
                .subtype
                .as_deref()
                .is_none_or(|subtype| subtype == "file_share")
    }
}

/// External queue recording outbound envelopes before dispatch. The queue
/// write is the durable record; a dispatch failure leaves the row for the
/// store's own redelivery machinery.
#[async_trait]
pub trait OutboundQueue: Send + Sync {
    async fn enqueue(&self, envelope: &RelayEnvelope) -> Result<()>;
}

/// In-memory queue for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryOutboundQueue {
    entries: std::sync::Mutex<Vec<RelayEnvelope>>,
}

impl MemoryOutboundQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn drain(&self) -> Vec<RelayEnvelope> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *entries)
    }
}

#[async_trait]
impl OutboundQueue for MemoryOutboundQueue {
    async fn enqueue(&self, envelope: &RelayEnvelope) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(envelope.clone());
        Ok(())
    }
}

/// Outbound side: envelopes originating from message events in this
/// workspace, delivered to the peer deployment's inbound endpoint.
pub struct OutboundRelay {
    client: Arc<dyn ChatClient>,
    tokens: Arc<dyn TokenStore>,
    queue: Arc<dyn OutboundQueue>,
    http: reqwest::Client,
    signing_secret: String,
    app_base_url: String,
    peer_inbound_url: String,
    peer_secret: Secret<String>,
    policy: RetryPolicy,
}

impl OutboundRelay {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn ChatClient>,
        tokens: Arc<dyn TokenStore>,
        queue: Arc<dyn OutboundQueue>,
        http: reqwest::Client,
        signing_secret: String,
        app_base_url: String,
        peer_inbound_url: String,
        peer_secret: Secret<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            tokens,
            queue,
            http,
            signing_secret,
            app_base_url,
            peer_inbound_url,
            peer_secret,
            policy,
        }
    }

    /// Relay one message event. Events outside relay channels (or without a
    /// recoverable routing key) are silently skipped; the subscription
    /// framework delivers every channel's traffic here.
    pub async fn handle_channel_message(&self, event: &ChannelMessageEvent) -> Result<()> {
        if !event.is_user_message() {
            return Ok(());
        }

        let info = retry_with_backoff(&self.policy, || {
            self.client.channel_info(&event.channel_id)
        })
        .await?;
        if !is_relay_channel(&info) {
            return Ok(());
        }
        let Some(routing) = info.topic.as_deref().and_then(parse_routing_key) else {
            warn!(
                channel_id = %event.channel_id,
                "relay channel has no routing topic; skipping"
            );
            return Ok(());
        };

        let external_id = event
            .event_id
            .clone()
            .unwrap_or_else(|| event.ts.clone());

        let mut files = Vec::with_capacity(event.files.len());
        for file in &event.files {
            let (params, url) = issue_proxy_file(
                self.tokens.as_ref(),
                &self.signing_secret,
                &self.app_base_url,
                ProxyFileGrant {
                    team_id: routing.team_id.clone(),
                    file_id: file.id.clone(),
                    filename: file.name.clone(),
                    mime_type: file.mime_type.clone(),
                    size: file.size,
                    ttl: PROXY_URL_TTL,
                },
            )
            .await?;
            files.push(RelayFile {
                filename: file.name.clone(),
                mime_type: file.mime_type.clone(),
                size: file.size,
                source: RelayFileSource::Proxy {
                    proxy_url: url,
                    expires_at: params.expires_at,
                },
            });
        }

        let text = event
            .text
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);

        if text.is_none() && files.is_empty() {
            return Ok(());
        }

        let envelope = RelayEnvelope {
            relay_key: build_relay_key(&[&routing.team_id, &routing.user_id, &external_id]),
            team_id: routing.team_id,
            user_id: routing.user_id,
            direction: RelayDirection::Outbound,
            text,
            files,
            external_id: Some(external_id),
        };

        self.queue.enqueue(&envelope).await?;
        self.dispatch(&envelope).await
    }

    /// POST the envelope to the peer's inbound endpoint. 429 and 5xx are
    /// retried; the peer answers 503 exactly when it wants redelivery.
    async fn dispatch(&self, envelope: &RelayEnvelope) -> Result<()> {
        retry_with_backoff(&self.policy, || async {
            let response = self
                .http
                .post(&self.peer_inbound_url)
                .header("x-relay-key", self.peer_secret.expose_secret())
                .json(envelope)
                .send()
                .await
                .map_err(PlatformError::transport)?;
            let status = response.status();
            if !status.is_success() {
                return Err(PlatformError::http(status.as_u16()));
            }
            Ok(())
        })
        .await?;

        info!(
            relay_key = %envelope.relay_key,
            files = envelope.files.len(),
            "outbound envelope dispatched to peer"
        );
        Ok(())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            capability::{ProxyFileQuery, verify},
            platform::{
                ChannelInfo, ChannelPage, ChatClientFactory, FileMetadata,
                MemoryInstallationStore, UploadSlot,
            },
            provision::{MemoryMappingStore, routing_topic},
            tokens::MemoryTokenStore,
        },
        dashmap::DashMap,
        std::result::Result,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    // ── Inbound flow ─────────────────────────────────────────────────────

    #[derive(Default)]
    struct ScriptedPlatform {
        channels: DashMap<String, String>,
        topics: DashMap<String, String>,
        posted: std::sync::Mutex<Vec<(String, String)>>,
        created: AtomicUsize,
    }

    #[async_trait]
    impl ChatClient for Arc<ScriptedPlatform> {
        async fn channel_info(&self, channel_id: &str) -> Result<ChannelInfo, PlatformError> {
            let name = self
                .channels
                .iter()
                .find(|entry| entry.value() == channel_id)
                .map(|entry| entry.key().clone());
            Ok(ChannelInfo {
                id: channel_id.to_string(),
                name,
                topic: self.topics.get(channel_id).map(|t| t.clone()),
            })
        }

        async fn create_channel(&self, name: &str) -> Result<String, PlatformError> {
            let id = format!("C{}", self.created.fetch_add(1, Ordering::SeqCst) + 1);
            self.channels.insert(name.to_string(), id.clone());
            Ok(id)
        }

        async fn set_channel_topic(
            &self,
            channel_id: &str,
            topic: &str,
        ) -> Result<(), PlatformError> {
            self.topics
                .insert(channel_id.to_string(), topic.to_string());
            Ok(())
        }

        async fn join_channel(&self, _channel_id: &str) -> Result<(), PlatformError> {
            Ok(())
        }

        async fn list_channels(
            &self,
            _cursor: Option<&str>,
        ) -> Result<ChannelPage, PlatformError> {
            Ok(ChannelPage {
                channels: Vec::new(),
                next_cursor: None,
            })
        }

        async fn post_message(&self, channel_id: &str, text: &str) -> Result<(), PlatformError> {
            self.posted
                .lock()
                .unwrap()
                .push((channel_id.to_string(), text.to_string()));
            Ok(())
        }

        async fn file_info(&self, _file_id: &str) -> Result<FileMetadata, PlatformError> {
            Err(PlatformError::api("file_not_found"))
        }

        async fn request_upload(
            &self,
            _filename: &str,
            _length: u64,
        ) -> Result<UploadSlot, PlatformError> {
            Err(PlatformError::api("not_implemented"))
        }

        async fn complete_upload(
            &self,
            _file_id: &str,
            _title: &str,
            _channel_id: &str,
        ) -> Result<(), PlatformError> {
            Ok(())
        }
    }

    struct NoFactory;

    impl ChatClientFactory for NoFactory {
        fn with_token(&self, _token: Secret<String>) -> Arc<dyn ChatClient> {
            Arc::new(Arc::new(ScriptedPlatform::default()))
        }
    }

    fn dispatcher(platform: Arc<ScriptedPlatform>) -> RelayDispatcher {
        let client: Arc<dyn ChatClient> = Arc::new(Arc::clone(&platform));
        let policy = RetryPolicy::default();
        RelayDispatcher::new(
            Arc::clone(&client),
            ChannelProvisioner::new(
                Arc::clone(&client),
                Arc::new(MemoryMappingStore::new()),
                policy,
            ),
            FileTransferPipeline::new(
                reqwest::Client::new(),
                Arc::clone(&client),
                Arc::new(MemoryInstallationStore::new()),
                Arc::new(NoFactory),
                policy,
            ),
            Arc::new(RateLimiterRegistry::new()),
            policy,
        )
    }

    fn inbound(team: &str, user: &str, text: &str) -> InboundRelayRequest {
        InboundRelayRequest {
            team_id: team.into(),
            user_id: user.into(),
            text: Some(text.into()),
            files: Vec::new(),
            relay_key: None,
        }
    }

    #[tokio::test]
    async fn inbound_provisions_channel_and_posts_text() {
        let platform = Arc::new(ScriptedPlatform::default());
        let dispatcher = dispatcher(Arc::clone(&platform));

        dispatcher
            .handle_inbound(inbound("T1", "U1", "hi"))
            .await
            .unwrap();

        assert_eq!(platform.created.load(Ordering::SeqCst), 1);
        let (name, id) = platform
            .channels
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .next()
            .unwrap();
        assert!(name.starts_with("ob-t1-u1-"));
        assert_eq!(
            platform.topics.get(&id).map(|t| t.clone()),
            Some("relay:T1:U1".to_string())
        );
        let posted = platform.posted.lock().unwrap().clone();
        assert_eq!(posted, vec![(id, "hi".to_string())]);
    }

    #[tokio::test]
    async fn inbound_without_identity_is_permanent() {
        let platform = Arc::new(ScriptedPlatform::default());
        let dispatcher = dispatcher(platform);

        let err = dispatcher
            .handle_inbound(inbound("", "U1", "hi"))
            .await
            .unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn inbound_with_empty_text_posts_nothing() {
        let platform = Arc::new(ScriptedPlatform::default());
        let dispatcher = dispatcher(Arc::clone(&platform));

        dispatcher
            .handle_inbound(inbound("T1", "U1", ""))
            .await
            .unwrap();
        assert!(platform.posted.lock().unwrap().is_empty());
    }

    // ── Outbound flow ────────────────────────────────────────────────────

    fn event(channel_id: &str, text: &str) -> ChannelMessageEvent {
        ChannelMessageEvent {
            channel_id: channel_id.into(),
            user: Some("U9".into()),
            bot_id: None,
            subtype: None,
            text: Some(text.into()),
            files: Vec::new(),
            event_id: Some("Ev1".into()),
            ts: "1700000000.000100".into(),
        }
    }

    fn outbound_relay(
        platform: Arc<ScriptedPlatform>,
        tokens: Arc<MemoryTokenStore>,
        queue: Arc<MemoryOutboundQueue>,
        peer_url: String,
    ) -> OutboundRelay {
        OutboundRelay::new(
            Arc::new(platform),
            tokens,
            queue,
            reqwest::Client::new(),
            "signing-secret".into(),
            "https://relay.example".into(),
            peer_url,
            Secret::new("peer-secret".into()),
            RetryPolicy::default(),
        )
    }

    #[tokio::test]
    async fn outbound_skips_bot_and_non_relay_channels() {
        let platform = Arc::new(ScriptedPlatform::default());
        let queue = Arc::new(MemoryOutboundQueue::new());
        let relay = outbound_relay(
            Arc::clone(&platform),
            Arc::new(MemoryTokenStore::new()),
            Arc::clone(&queue),
            "http://127.0.0.1:1/relay/inbound".into(),
        );

        // Bot message: skipped before any lookup.
        let mut bot_event = event("C1", "beep");
        bot_event.bot_id = Some("B1".into());
        relay.handle_channel_message(&bot_event).await.unwrap();

        // Ordinary channel without routing topic: skipped after lookup.
        relay.handle_channel_message(&event("C1", "hi")).await.unwrap();

        assert!(queue.drain().is_empty());
    }

    #[tokio::test]
    async fn outbound_builds_envelope_and_posts_to_peer() {
        let mut peer = mockito::Server::new_async().await;
        let inbound_mock = peer
            .mock("POST", "/relay/inbound")
            .match_header("x-relay-key", "peer-secret")
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let platform = Arc::new(ScriptedPlatform::default());
        platform
            .topics
            .insert("C7".to_string(), routing_topic("T1", "U1"));
        let tokens = Arc::new(MemoryTokenStore::new());
        let queue = Arc::new(MemoryOutboundQueue::new());
        let relay = outbound_relay(
            Arc::clone(&platform),
            Arc::clone(&tokens),
            Arc::clone(&queue),
            format!("{}/relay/inbound", peer.url()),
        );

        let mut message = event("C7", "  hello there  ");
        message.files.push(MessageFile {
            id: "F42".into(),
            name: Some("notes.txt".into()),
            mime_type: Some("text/plain".into()),
            size: Some(9),
        });
        relay.handle_channel_message(&message).await.unwrap();

        inbound_mock.assert_async().await;

        let queued = queue.drain();
        assert_eq!(queued.len(), 1);
        let envelope = &queued[0];
        assert_eq!(envelope.relay_key, "T1:U1:Ev1");
        assert_eq!(envelope.team_id, "T1");
        assert_eq!(envelope.direction, RelayDirection::Outbound);
        assert_eq!(envelope.text.as_deref(), Some("hello there"));
        assert_eq!(envelope.files.len(), 1);

        // The wrapped file carries a verifiable capability URL.
        let RelayFileSource::Proxy { proxy_url, .. } = &envelope.files[0].source else {
            panic!("expected proxy transport");
        };
        let parsed = url::Url::parse(proxy_url).unwrap();
        let mut query = ProxyFileQuery::default();
        for (key, value) in parsed.query_pairs() {
            let value = value.into_owned();
            match key.as_ref() {
                "teamId" => query.team_id = value,
                "fileId" => query.file_id = value,
                "expiresAt" => query.expires_at = value.parse().ok(),
                "filename" => query.filename = value,
                "mimeType" => query.mime_type = value,
                "size" => query.size = value,
                "token" => query.token = value,
                "sig" => query.sig = value,
                _ => {},
            }
        }
        let (params, sig) = query.into_params().unwrap();
        assert_eq!(params.file_id, "F42");
        assert!(verify("signing-secret", &params, &sig));
    }

    #[tokio::test]
    async fn outbound_without_content_is_skipped() {
        let platform = Arc::new(ScriptedPlatform::default());
        platform
            .topics
            .insert("C7".to_string(), routing_topic("T1", "U1"));
        let queue = Arc::new(MemoryOutboundQueue::new());
        let relay = outbound_relay(
            Arc::clone(&platform),
            Arc::new(MemoryTokenStore::new()),
            Arc::clone(&queue),
            "http://127.0.0.1:1/relay/inbound".into(),
        );

        relay.handle_channel_message(&event("C7", "   ")).await.unwrap();
        assert!(queue.drain().is_empty());
    }
}
