//! `GET /relay/file`: the signed capability proxy.
//!
//! Streams a private platform file to an unauthenticated caller holding a
//! valid capability URL. The source credential never leaves this process;
//! the token behind the URL is consumed by the claim, so a replayed URL
//! dies at `token_unavailable`.

use {
    axum::{
        Json,
        body::Body,
        extract::{Query, State, rejection::QueryRejection},
        http::{StatusCode, header},
        response::{IntoResponse, Response},
    },
    futures::StreamExt,
    secrecy::ExposeSecret,
    tracing::{error, warn},
};

use obridge_relay::{
    capability::{CLAIM_TTL, ProxyFileQuery, verify},
    clock::now_epoch_ms,
    error::Error,
    retry_with_backoff,
    tokens::{TokenError, TokenStore},
};

use crate::state::GatewayState;

fn failure(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "ok": false, "error": error })),
    )
        .into_response()
}

fn map_error(err: &Error) -> Response {
    let status = match err {
        Error::MissingParams => StatusCode::BAD_REQUEST,
        Error::Expired | Error::InvalidSignature | Error::Token(TokenError::Unavailable) => {
            StatusCode::UNAUTHORIZED
        },
        Error::MissingFileUrl => StatusCode::NOT_FOUND,
        Error::FileFetchFailed { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    failure(status, err.code())
}

/// Strip a filename down to what fits safely inside a quoted
/// `content-disposition` value: printable ASCII minus quotes and
/// backslashes.
fn sanitize_disposition_name(name: &str) -> String {
    name.chars()
        .filter(|ch| (' '..='~').contains(ch) && *ch != '"' && *ch != '\\')
        .collect::<String>()
        .trim()
        .to_string()
}

pub async fn handle(
    State(state): State<GatewayState>,
    query: Result<Query<ProxyFileQuery>, QueryRejection>,
) -> Response {
    let Ok(Query(query)) = query else {
        return failure(StatusCode::BAD_REQUEST, "missing_params");
    };
    let (params, sig) = match query.into_params() {
        Ok(parsed) => parsed,
        Err(err) => return map_error(&err),
    };

    // Expiry is checked before the signature: an expired URL is rejected as
    // expired even when the signature is valid.
    if now_epoch_ms() > params.expires_at {
        return failure(StatusCode::UNAUTHORIZED, "expired");
    }
    if !verify(state.relay_secret.expose_secret(), &params, &sig) {
        return failure(StatusCode::UNAUTHORIZED, "invalid_signature");
    }

    let token = params.token.clone().unwrap_or_default();
    if let Err(err) = state
        .tokens
        .claim(&params.team_id, &params.file_id, &token, CLAIM_TTL)
        .await
    {
        // Claim conflicts are expected concurrency outcomes, not faults.
        return map_error(&Error::Token(err));
    }

    match stream_file(&state, &params.file_id).await {
        Ok(response) => {
            finalize_or_release_after(response, state, params.team_id, params.file_id, token)
        },
        Err(err) => {
            release_best_effort(&state, &params.team_id, &params.file_id, &token).await;
            error!(
                team_id = %params.team_id,
                file_id = %params.file_id,
                error = %err,
                "relay file proxy failed"
            );
            map_error(&err)
        },
    }
}

/// Resolve the file at the source platform and open its byte stream.
async fn stream_file(
    state: &GatewayState,
    file_id: &str,
) -> Result<(obridge_relay::platform::FileMetadata, reqwest::Response), Error> {
    let meta = retry_with_backoff(&state.policy, || state.chat.file_info(file_id)).await?;
    let Some(url) = meta.url.clone().filter(|url| !url.is_empty()) else {
        return Err(Error::MissingFileUrl);
    };

    let response = state
        .http
        .get(&url)
        .bearer_auth(state.bot_token.expose_secret())
        .send()
        .await
        .map_err(|e| Error::external("source fetch", e))?;
    if !response.status().is_success() {
        return Err(Error::FileFetchFailed {
            status: response.status().as_u16(),
        });
    }
    Ok((meta, response))
}

/// Build the streaming response. The token is finalized only once the
/// source stream ends cleanly, released if it errors mid-flight. A caller
/// that drops the connection leaves the claim to lapse via its TTL.
fn finalize_or_release_after(
    (meta, upstream): (obridge_relay::platform::FileMetadata, reqwest::Response),
    state: GatewayState,
    team_id: String,
    file_id: String,
    token: String,
) -> Response {
    let body = async_stream::stream! {
        let mut chunks = upstream.bytes_stream();
        let mut failed = false;
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => yield Ok::<_, std::io::Error>(bytes),
                Err(err) => {
                    warn!(file_id = %file_id, error = %err, "source stream aborted");
                    failed = true;
                    yield Err(std::io::Error::other(err));
                    break;
                },
            }
        }
        if failed {
            release_best_effort(&state, &team_id, &file_id, &token).await;
        } else if let Err(err) = state.tokens.finalize(&team_id, &file_id, &token).await {
            warn!(file_id = %file_id, error = %err, "token finalize failed");
        }
    };

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, meta.mime_type.clone());
    if let Some(size) = meta.size {
        response = response.header(header::CONTENT_LENGTH, size);
    }
    let safe_name = sanitize_disposition_name(&meta.name);
    if !safe_name.is_empty() {
        response = response.header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{safe_name}\""),
        );
    }
    response
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| failure(StatusCode::INTERNAL_SERVER_ERROR, "server_error"))
}

async fn release_best_effort(state: &GatewayState, team_id: &str, file_id: &str, token: &str) {
    if let Err(err) = state.tokens.release(team_id, file_id, token).await {
        warn!(file_id = %file_id, error = %err, "token release failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disposition_name_drops_unsafe_characters() {
        assert_eq!(sanitize_disposition_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_disposition_name("a\"b\\c.txt"), "abc.txt");
        assert_eq!(sanitize_disposition_name("résumé.pdf"), "rsum.pdf");
        assert_eq!(sanitize_disposition_name("  spaced  "), "spaced");
        assert_eq!(sanitize_disposition_name("\u{7}\u{8}"), "");
    }
}
