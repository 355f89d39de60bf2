//! Signed capability URLs for the file proxy.
//!
//! A capability URL carries every field of the download grant in plaintext
//! query parameters plus an HMAC-SHA-256 signature over a fixed-order
//! canonical payload. The signature keeps the source platform's credentials
//! out of the URL; the single-use token (see [`crate::tokens`]) and the
//! expiry keep a leaked URL from being replayed.

use std::time::Duration;

use {
    hmac::{Hmac, Mac},
    rand::Rng,
    serde::Deserialize,
    sha2::Sha256,
    url::Url,
};

use crate::{
    clock::now_epoch_ms,
    error::{Error, Result},
    tokens::{CapabilityToken, TokenState, TokenStore},
};

type HmacSha256 = Hmac<Sha256>;

/// Recommended end-to-end TTL for a capability URL.
pub const PROXY_URL_TTL: Duration = Duration::from_secs(15 * 60);

/// Claim guard TTL while a download is streaming.
pub const CLAIM_TTL: Duration = Duration::from_secs(60);

const TOKEN_LEN: usize = 32;

/// The signed fields of one file grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyFileParams {
    pub team_id: String,
    pub file_id: String,
    /// Epoch milliseconds.
    pub expires_at: i64,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub token: Option<String>,
}

impl ProxyFileParams {
    /// Canonical fixed-order payload. Missing optional fields serialize as
    /// the empty string so both sides agree on the exact bytes signed.
    #[must_use]
    pub fn signature_payload(&self) -> String {
        fn norm<T: ToString>(value: Option<&T>) -> String {
            value.map(ToString::to_string).unwrap_or_default()
        }
        [
            self.team_id.clone(),
            self.file_id.clone(),
            self.expires_at.to_string(),
            norm(self.filename.as_ref()),
            norm(self.mime_type.as_ref()),
            norm(self.size.as_ref()),
            norm(self.token.as_ref()),
        ]
        .join(":")
    }
}

/// HMAC-SHA-256 over the canonical payload, hex encoded.
pub fn sign(secret: &str, params: &ProxyFileParams) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::external("create hmac", e))?;
    mac.update(params.signature_payload().as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Recompute and compare in constant time. Any signing failure verifies as
/// false rather than leaking an error path.
#[must_use]
pub fn verify(secret: &str, params: &ProxyFileParams, signature: &str) -> bool {
    match sign(secret, params) {
        Ok(expected) => constant_time_eq(&expected, signature),
        Err(_) => false,
    }
}

/// Constant-time string comparison: equal-length inputs are compared
/// bytewise without early exit; a length mismatch rejects immediately
/// without inspecting content.
#[must_use]
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Random single-use token identifier.
#[must_use]
pub fn mint_token() -> String {
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Build the signed proxy URL for `params` under `base_url`.
pub fn build_proxy_url(base_url: &str, secret: &str, params: &ProxyFileParams) -> Result<String> {
    let sig = sign(secret, params)?;
    let mut url = Url::parse(&format!(
        "{}/relay/file",
        base_url.trim_end_matches('/')
    ))
    .map_err(|e| Error::external("parse proxy base url", e))?;
    url.query_pairs_mut()
        .append_pair("teamId", &params.team_id)
        .append_pair("fileId", &params.file_id)
        .append_pair("expiresAt", &params.expires_at.to_string())
        .append_pair("filename", params.filename.as_deref().unwrap_or(""))
        .append_pair("mimeType", params.mime_type.as_deref().unwrap_or(""))
        .append_pair(
            "size",
            &params.size.map(|s| s.to_string()).unwrap_or_default(),
        )
        .append_pair("token", params.token.as_deref().unwrap_or(""))
        .append_pair("sig", &sig);
    Ok(url.to_string())
}

/// A download grant to issue: which file, plus the metadata embedded in the
/// signed URL so the receiver can size-check before fetching.
#[derive(Debug, Clone)]
pub struct ProxyFileGrant {
    pub team_id: String,
    pub file_id: String,
    pub filename: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub ttl: Duration,
}

/// Mint a token, record it as issued, and return the signed proxy URL plus
/// the grant parameters.
pub async fn issue_proxy_file(
    store: &dyn TokenStore,
    secret: &str,
    base_url: &str,
    grant: ProxyFileGrant,
) -> Result<(ProxyFileParams, String)> {
    let token = mint_token();
    let expires_at = now_epoch_ms() + grant.ttl.as_millis() as i64;
    store
        .create(CapabilityToken {
            team_id: grant.team_id.clone(),
            file_id: grant.file_id.clone(),
            token: token.clone(),
            state: TokenState::Issued,
            expires_at,
            claim_expires_at: None,
        })
        .await?;
    let params = ProxyFileParams {
        team_id: grant.team_id,
        file_id: grant.file_id,
        expires_at,
        filename: grant.filename,
        mime_type: grant.mime_type,
        size: grant.size,
        token: Some(token),
    };
    let url = build_proxy_url(base_url, secret, &params)?;
    Ok((params, url))
}

/// Raw query parameters of a proxy request, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyFileQuery {
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub file_id: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub sig: String,
}

impl ProxyFileQuery {
    /// Validate required parameters and reconstruct the signed payload.
    /// Returns the grant parameters and the supplied signature.
    pub fn into_params(self) -> Result<(ProxyFileParams, String)> {
        let expires_at = self.expires_at.unwrap_or(0);
        if self.team_id.is_empty()
            || self.file_id.is_empty()
            || expires_at == 0
            || self.token.is_empty()
            || self.sig.is_empty()
        {
            return Err(Error::MissingParams);
        }
        let size = if self.size.is_empty() {
            None
        } else {
            Some(
                self.size
                    .parse::<u64>()
                    .map_err(|_| Error::MissingParams)?,
            )
        };
        let params = ProxyFileParams {
            team_id: self.team_id,
            file_id: self.file_id,
            expires_at,
            filename: (!self.filename.is_empty()).then_some(self.filename),
            mime_type: (!self.mime_type.is_empty()).then_some(self.mime_type),
            size,
            token: Some(self.token),
        };
        Ok((params, self.sig))
    }
}
