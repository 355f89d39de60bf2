//! Shared-secret authentication for the inbound relay endpoint.

use {
    axum::http::HeaderMap,
    secrecy::{ExposeSecret, Secret},
};

use obridge_relay::capability::constant_time_eq;

/// Accept the secret from `x-relay-key` or `Authorization: Bearer`.
/// Comparison is constant time; an absent or empty secret never matches.
#[must_use]
pub fn authorize(headers: &HeaderMap, secret: &Secret<String>) -> bool {
    if secret.expose_secret().is_empty() {
        return false;
    }
    let provided = headers
        .get("x-relay-key")
        .and_then(|value| value.to_str().ok())
        .or_else(|| {
            headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
        });
    match provided {
        Some(provided) => constant_time_eq(provided, secret.expose_secret()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use {super::*, axum::http::HeaderValue};

    fn secret() -> Secret<String> {
        Secret::new("relay-secret".into())
    }

    #[test]
    fn accepts_relay_key_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-relay-key", HeaderValue::from_static("relay-secret"));
        assert!(authorize(&headers, &secret()));
    }

    #[test]
    fn accepts_bearer_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer relay-secret"),
        );
        assert!(authorize(&headers, &secret()));
    }

    #[test]
    fn rejects_wrong_or_absent_secret() {
        let mut headers = HeaderMap::new();
        assert!(!authorize(&headers, &secret()));
        headers.insert("x-relay-key", HeaderValue::from_static("nope"));
        assert!(!authorize(&headers, &secret()));
    }

    #[test]
    fn empty_configured_secret_never_matches() {
        let mut headers = HeaderMap::new();
        headers.insert("x-relay-key", HeaderValue::from_static(""));
        assert!(!authorize(&headers, &Secret::new(String::new())));
    }
}
