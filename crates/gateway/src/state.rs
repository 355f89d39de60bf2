use std::sync::Arc;

use secrecy::Secret;

use obridge_relay::{
    backoff::RetryPolicy,
    dispatch::RelayDispatcher,
    platform::ChatClient,
    tokens::TokenStore,
};

/// Everything the HTTP handlers need, cheaply cloneable.
#[derive(Clone)]
pub struct GatewayState {
    /// Shared secret: authenticates inbound relay calls and signs/verifies
    /// capability URLs.
    pub relay_secret: Secret<String>,
    /// Bot credential for this workspace, used by the proxy's source fetch.
    pub bot_token: Secret<String>,
    pub chat: Arc<dyn ChatClient>,
    pub tokens: Arc<dyn TokenStore>,
    pub dispatcher: Arc<RelayDispatcher>,
    pub http: reqwest::Client,
    pub policy: RetryPolicy,
}
