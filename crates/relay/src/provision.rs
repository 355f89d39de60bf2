//! Per-user channel provisioning.
//!
//! Every `(team, user)` routing key maps to exactly one channel in the
//! responder workspace. The mapping store is the fast path; the channel
//! topic carries a `relay:<teamId>:<userId>` routing token so any channel
//! can be reclassified from the platform alone if the store is lost.

use std::sync::Arc;

use {
    async_trait::async_trait,
    dashmap::DashMap,
    sha2::{Digest, Sha256},
    tracing::{debug, info},
};

use crate::{
    backoff::{RetryPolicy, retry_with_backoff},
    error::{Error, Result},
    platform::{ChannelInfo, ChatClient},
};

/// Channel names created by the relay start with this prefix.
pub const CHANNEL_PREFIX: &str = "ob-";

/// Platform error code for a channel-name collision.
const NAME_TAKEN: &str = "name_taken";

const MAX_BASE_NAME_LEN: usize = 65;
const HASH_SUFFIX_LEN: usize = 4;

/// A provisioned `(team, user) → channel` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMapping {
    pub team_id: String,
    pub user_id: String,
    pub channel_id: String,
    pub channel_name: String,
}

/// External channel-mapping store, keyed by `(team_id, user_id)`.
#[async_trait]
pub trait MappingStore: Send + Sync {
    async fn get(&self, team_id: &str, user_id: &str) -> Result<Option<ChannelMapping>>;
    async fn set(&self, mapping: ChannelMapping) -> Result<()>;
}

/// In-memory mapping store for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryMappingStore {
    mappings: DashMap<(String, String), ChannelMapping>,
}

impl MemoryMappingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MappingStore for MemoryMappingStore {
    async fn get(&self, team_id: &str, user_id: &str) -> Result<Option<ChannelMapping>> {
        Ok(self
            .mappings
            .get(&(team_id.to_string(), user_id.to_string()))
            .map(|entry| entry.clone()))
    }

    async fn set(&self, mapping: ChannelMapping) -> Result<()> {
        self.mappings.insert(
            (mapping.team_id.clone(), mapping.user_id.clone()),
            mapping,
        );
        Ok(())
    }
}

/// The routing key recovered from a channel topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingKey {
    pub team_id: String,
    pub user_id: String,
}

/// Lowercase, collapse anything outside `[a-z0-9-_]` into single dashes,
/// and cap the length. Platform channel names are restrictive.
#[must_use]
pub fn sanitize_channel_name(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut last_dash = false;
    for ch in value.to_lowercase().chars() {
        if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.truncate(MAX_BASE_NAME_LEN);
    out
}

/// Short stable suffix so visually similar sanitized names cannot collide.
#[must_use]
pub fn hash_suffix(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..HASH_SUFFIX_LEN].to_string()
}

/// Deterministic channel name for a routing key, e.g. `ob-t1-u1-3f2a`.
#[must_use]
pub fn build_channel_name(team_id: &str, user_id: &str) -> String {
    let base = sanitize_channel_name(&format!("{CHANNEL_PREFIX}{team_id}-{user_id}"));
    format!("{base}-{}", hash_suffix(&format!("{team_id}:{user_id}")))
}

/// The inspectable routing token stored in the channel topic.
#[must_use]
pub fn routing_topic(team_id: &str, user_id: &str) -> String {
    format!("relay:{team_id}:{user_id}")
}

/// Parse `relay:<teamId>:<userId>` back into a routing key. Anything else
/// (wrong prefix, missing segment, extra segments) is not a routing token.
#[must_use]
pub fn parse_routing_key(topic: &str) -> Option<RoutingKey> {
    let rest = topic.strip_prefix("relay:")?;
    let (team_id, user_id) = rest.split_once(':')?;
    if team_id.is_empty() || user_id.is_empty() || user_id.contains(':') {
        return None;
    }
    Some(RoutingKey {
        team_id: team_id.to_string(),
        user_id: user_id.to_string(),
    })
}

/// Whether a channel looks relay-managed: routing token in the topic, or
/// the naming convention as a fallback when the topic was wiped.
#[must_use]
pub fn is_relay_channel(info: &ChannelInfo) -> bool {
    info.topic
        .as_deref()
        .is_some_and(|topic| parse_routing_key(topic).is_some())
        || info
            .name
            .as_deref()
            .is_some_and(|name| name.starts_with(CHANNEL_PREFIX))
}

/// Idempotent channel provisioning. Safe under concurrent callers for the
/// same key: creation races resolve through the name-collision fallback and
/// both callers converge on the same channel id.
pub struct ChannelProvisioner {
    client: Arc<dyn ChatClient>,
    mappings: Arc<dyn MappingStore>,
    policy: RetryPolicy,
}

impl ChannelProvisioner {
    pub fn new(
        client: Arc<dyn ChatClient>,
        mappings: Arc<dyn MappingStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            client,
            mappings,
            policy,
        }
    }

    /// Return the channel id for `(team_id, user_id)`, creating the channel
    /// on first use. The mapping is re-read on every call; nothing is
    /// cached across calls, so concurrent first creators are tolerated.
    pub async fn ensure_channel(&self, team_id: &str, user_id: &str) -> Result<String> {
        if let Some(mapping) = self.mappings.get(team_id, user_id).await? {
            // The bot may have been removed from the channel since the
            // mapping was written. Join failures are swallowed: joining an
            // already-joined channel is the common case.
            if let Err(err) = retry_with_backoff(&self.policy, || {
                self.client.join_channel(&mapping.channel_id)
            })
            .await
            {
                debug!(
                    channel_id = %mapping.channel_id,
                    error = %err,
                    "defensive channel join failed"
                );
            }
            return Ok(mapping.channel_id);
        }

        let name = build_channel_name(team_id, user_id);
        let channel_id = match retry_with_backoff(&self.policy, || {
            self.client.create_channel(&name)
        })
        .await
        {
            Ok(id) => {
                info!(team_id, user_id, channel = %name, "created relay channel");
                id
            },
            Err(err) if err.api_code() == Some(NAME_TAKEN) => {
                // Lost a creation race, or a previous attempt died between
                // create and persist. The channel exists; find it.
                self.find_channel_by_name(&name).await?.ok_or_else(|| {
                    Error::unavailable(format!(
                        "channel name {name} taken but absent from listing"
                    ))
                })?
            },
            Err(err) => return Err(err.into()),
        };

        let topic = routing_topic(team_id, user_id);
        retry_with_backoff(&self.policy, || {
            self.client.set_channel_topic(&channel_id, &topic)
        })
        .await?;

        self.mappings
            .set(ChannelMapping {
                team_id: team_id.to_string(),
                user_id: user_id.to_string(),
                channel_id: channel_id.clone(),
                channel_name: name,
            })
            .await?;

        Ok(channel_id)
    }

    async fn find_channel_by_name(&self, name: &str) -> Result<Option<String>> {
        let mut cursor: Option<String> = None;
        loop {
            let page = retry_with_backoff(&self.policy, || {
                self.client.list_channels(cursor.as_deref())
            })
            .await?;
            if let Some(found) = page
                .channels
                .iter()
                .find(|channel| channel.name.as_deref() == Some(name))
            {
                return Ok(Some(found.id.clone()));
            }
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(None),
            }
        }
    }
}
