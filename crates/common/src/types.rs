//! Relay envelope and attachment types shared by both workspace apps.

use serde::{Deserialize, Serialize};

/// Marker for the workspace an attachment originates from.
pub const WORKSPACE_USER_APP: &str = "userApp";
pub const WORKSPACE_RESPONDER: &str = "responder";

/// Which way an envelope travels between the two workspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayDirection {
    Inbound,
    Outbound,
}

/// One unit of cross-workspace delivery: text plus attachment references,
/// tagged with an idempotency key. Retried delivery of the same platform
/// event must reuse the same `relay_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    pub relay_key: String,
    pub team_id: String,
    pub user_id: String,
    pub direction: RelayDirection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<RelayFile>,
    /// Platform event id (or message timestamp) of the originating event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
}

/// An attachment reference. Never raw bytes, only enough for the receiver
/// to stream the file from wherever it lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(flatten)]
    pub source: RelayFileSource,
}

/// How the receiver obtains the bytes. Exactly one transport is populated
/// per file; the wire shape stays flat for compatibility with both apps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelayFileSource {
    /// A signed, TTL-bounded capability URL served by the sender's proxy.
    #[serde(rename_all = "camelCase")]
    Proxy { proxy_url: String, expires_at: i64 },
    /// A platform file id fetched directly with the source workspace's own
    /// bot credential.
    #[serde(rename_all = "camelCase")]
    Direct {
        source_file_id: String,
        source_workspace: String,
    },
}

/// Join non-empty key parts with `:`. Used for relay idempotency keys of
/// the form `teamId:userId:eventId`.
#[must_use]
pub fn build_relay_key(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(":")
}
