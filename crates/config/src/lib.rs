//! Environment-driven configuration for the relay gateway.
//!
//! All settings come from the process environment (a `.env` file is loaded
//! by the binary before this runs). Secrets are wrapped in
//! [`secrecy::Secret`] and never appear in `Debug` output.

use secrecy::Secret;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("missing required environment variable {key}")]
    Missing { key: &'static str },

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// Runtime configuration for one relay deployment.
#[derive(Clone)]
pub struct AppConfig {
    /// Address the HTTP gateway binds to.
    pub bind: String,
    pub port: u16,
    /// Public base URL of this deployment, used to mint proxy file URLs.
    pub app_base_url: String,
    /// Bot token for this deployment's own workspace.
    pub slack_bot_token: Secret<String>,
    /// Shared secret authenticating inbound relay calls and signing
    /// capability URLs.
    pub relay_secret: Secret<String>,
    /// `/relay/inbound` endpoint of the peer workspace's deployment, when
    /// this side also originates outbound envelopes.
    pub peer_inbound_url: Option<String>,
    /// Relay secret of the peer deployment (defaults to `relay_secret`).
    pub peer_relay_secret: Option<Secret<String>>,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("bind", &self.bind)
            .field("port", &self.port)
            .field("app_base_url", &self.app_base_url)
            .field("slack_bot_token", &"[REDACTED]")
            .field("relay_secret", &"[REDACTED]")
            .field("peer_inbound_url", &self.peer_inbound_url)
            .finish_non_exhaustive()
    }
}

impl AppConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary lookup function. Exists so tests can feed a
    /// map instead of mutating process-global state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &'static str| -> Result<String> {
            match lookup(key) {
                Some(value) if !value.trim().is_empty() => Ok(value),
                _ => Err(Error::Missing { key }),
            }
        };

        let port = match lookup("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|e| Error::Invalid {
                key: "PORT",
                message: e.to_string(),
            })?,
            None => 4000,
        };

        let app_base_url = required("APP_BASE_URL")?;
        if !app_base_url.starts_with("http://") && !app_base_url.starts_with("https://") {
            return Err(Error::Invalid {
                key: "APP_BASE_URL",
                message: "must be an absolute http(s) URL".into(),
            });
        }

        Ok(Self {
            bind: lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            app_base_url,
            slack_bot_token: Secret::new(required("SLACK_BOT_TOKEN")?),
            relay_secret: Secret::new(required("RELAY_WEBHOOK_SECRET")?),
            peer_inbound_url: lookup("PEER_INBOUND_URL").filter(|v| !v.trim().is_empty()),
            peer_relay_secret: lookup("PEER_RELAY_SECRET")
                .filter(|v| !v.trim().is_empty())
                .map(Secret::new),
        })
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashMap};

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn base_env() -> HashMap<String, String> {
        env(&[
            ("APP_BASE_URL", "https://relay.example"),
            ("SLACK_BOT_TOKEN", "xoxb-test"),
            ("RELAY_WEBHOOK_SECRET", "shh"),
        ])
    }

    #[test]
    fn loads_with_defaults() {
        let vars = base_env();
        let config = AppConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.bind, "0.0.0.0");
        assert_eq!(config.port, 4000);
        assert!(config.peer_inbound_url.is_none());
    }

    #[test]
    fn missing_secret_is_an_error() {
        let mut vars = base_env();
        vars.remove("RELAY_WEBHOOK_SECRET");
        let err = AppConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(
            err,
            Error::Missing {
                key: "RELAY_WEBHOOK_SECRET"
            }
        ));
    }

    #[test]
    fn rejects_non_http_base_url() {
        let mut vars = base_env();
        vars.insert("APP_BASE_URL".into(), "relay.example".into());
        let err = AppConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, Error::Invalid { key: "APP_BASE_URL", .. }));
    }

    #[test]
    fn rejects_bad_port() {
        let mut vars = base_env();
        vars.insert("PORT".into(), "not-a-port".into());
        let err = AppConfig::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, Error::Invalid { key: "PORT", .. }));
    }

    #[test]
    fn debug_redacts_secrets() {
        let vars = base_env();
        let config = AppConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("xoxb-test"));
        assert!(!rendered.contains("shh"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
