//! Capability token lifecycle: `issued → claimed → {finalized | released}`.
//!
//! The store enforces the transition table and the per-`(team, file, token)`
//! atomicity the relay depends on. A claim failure is an expected
//! concurrency outcome (retried proxy requests race the first claimant) and
//! is reported as [`TokenError::Unavailable`], never logged as a fault.

use std::time::Duration;

use {
    async_trait::async_trait,
    dashmap::{DashMap, mapref::entry::Entry},
    serde::{Deserialize, Serialize},
};

use crate::clock::now_epoch_ms;

/// Token lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenState {
    Issued,
    Claimed,
    Finalized,
    Released,
}

impl TokenState {
    /// The transition table. Everything not listed is rejected at the store
    /// boundary.
    #[must_use]
    pub fn can_transition(self, next: TokenState) -> bool {
        matches!(
            (self, next),
            (TokenState::Issued, TokenState::Claimed)
                | (TokenState::Claimed, TokenState::Finalized)
                | (TokenState::Claimed, TokenState::Released)
        )
    }

    /// Finalized and released tokens never move again.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, TokenState::Finalized | TokenState::Released)
    }
}

/// A single-use download capability for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityToken {
    pub team_id: String,
    pub file_id: String,
    pub token: String,
    pub state: TokenState,
    /// End-to-end expiry (epoch ms). A token past this point is void in any
    /// state.
    pub expires_at: i64,
    /// Claim-guard expiry (epoch ms). A lapsed claim may be reclaimed.
    pub claim_expires_at: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Missing, expired, already claimed, or terminal. Expected under
    /// concurrent or replayed proxy requests.
    #[error("token unavailable")]
    Unavailable,

    /// The backing store itself failed.
    #[error("token store failed: {message}")]
    Store { message: String },
}

/// External single-use-token store. Implementations must make each
/// transition atomic per `(team_id, file_id, token)` triple.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Record a freshly minted token in state `issued`.
    async fn create(&self, record: CapabilityToken) -> Result<(), TokenError>;

    /// Atomically transition `issued → claimed` with a claim TTL guarding
    /// against a retried-but-already-streaming request. A claim whose TTL
    /// lapsed without cleanup is eligible for reclaim.
    async fn claim(
        &self,
        team_id: &str,
        file_id: &str,
        token: &str,
        claim_ttl: Duration,
    ) -> Result<(), TokenError>;

    /// `claimed → finalized`, after the proxied stream was fully written.
    async fn finalize(&self, team_id: &str, file_id: &str, token: &str) -> Result<(), TokenError>;

    /// `claimed → released`, on any failure downstream of a successful
    /// claim. Terminal: the token is not re-issuable.
    async fn release(&self, team_id: &str, file_id: &str, token: &str) -> Result<(), TokenError>;
}

type TokenKey = (String, String, String);

/// In-memory store for single-process deployments and tests. The `DashMap`
/// entry guard provides the per-triple atomicity the trait demands.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    records: DashMap<TokenKey, CapabilityToken>,
}

impl MemoryTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(team_id: &str, file_id: &str, token: &str) -> TokenKey {
        (team_id.to_string(), file_id.to_string(), token.to_string())
    }

    fn claim_at(
        &self,
        team_id: &str,
        file_id: &str,
        token: &str,
        claim_ttl: Duration,
        now_ms: i64,
    ) -> Result<(), TokenError> {
        let key = Self::key(team_id, file_id, token);
        let Some(mut record) = self.records.get_mut(&key) else {
            return Err(TokenError::Unavailable);
        };
        if now_ms > record.expires_at {
            return Err(TokenError::Unavailable);
        }
        let reclaimable = record.state == TokenState::Claimed
            && record.claim_expires_at.is_some_and(|at| now_ms > at);
        if record.state.can_transition(TokenState::Claimed) || reclaimable {
            record.state = TokenState::Claimed;
            record.claim_expires_at = Some(now_ms + claim_ttl.as_millis() as i64);
            Ok(())
        } else {
            Err(TokenError::Unavailable)
        }
    }

    fn transition(
        &self,
        team_id: &str,
        file_id: &str,
        token: &str,
        next: TokenState,
    ) -> Result<(), TokenError> {
        let key = Self::key(team_id, file_id, token);
        let Some(mut record) = self.records.get_mut(&key) else {
            return Err(TokenError::Unavailable);
        };
        if !record.state.can_transition(next) {
            return Err(TokenError::Unavailable);
        }
        record.state = next;
        record.claim_expires_at = None;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn create(&self, record: CapabilityToken) -> Result<(), TokenError> {
        let key = Self::key(&record.team_id, &record.file_id, &record.token);
        match self.records.entry(key) {
            Entry::Occupied(_) => Err(TokenError::Store {
                message: "duplicate token".into(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(())
            },
        }
    }

    async fn claim(
        &self,
        team_id: &str,
        file_id: &str,
        token: &str,
        claim_ttl: Duration,
    ) -> Result<(), TokenError> {
        self.claim_at(team_id, file_id, token, claim_ttl, now_epoch_ms())
    }

    async fn finalize(&self, team_id: &str, file_id: &str, token: &str) -> Result<(), TokenError> {
        self.transition(team_id, file_id, token, TokenState::Finalized)
    }

    async fn release(&self, team_id: &str, file_id: &str, token: &str) -> Result<(), TokenError> {
        self.transition(team_id, file_id, token, TokenState::Released)
    }
}
