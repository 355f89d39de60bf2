//! `POST /relay/inbound`: one envelope from the peer workspace.

use {
    axum::{
        Json,
        extract::{State, rejection::JsonRejection},
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
    },
    tracing::warn,
};

use obridge_relay::dispatch::InboundRelayRequest;

use crate::{auth::authorize, state::GatewayState};

fn reply(status: StatusCode, error: Option<&str>) -> Response {
    match error {
        None => (status, Json(serde_json::json!({ "ok": true }))).into_response(),
        Some(error) => (
            status,
            Json(serde_json::json!({ "ok": false, "error": error })),
        )
            .into_response(),
    }
}

pub async fn handle(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Result<Json<InboundRelayRequest>, JsonRejection>,
) -> Response {
    if !authorize(&headers, &state.relay_secret) {
        return reply(StatusCode::UNAUTHORIZED, Some("unauthorized"));
    }

    let Ok(Json(request)) = body else {
        return reply(StatusCode::BAD_REQUEST, Some("malformed_body"));
    };
    if request.team_id.is_empty() || request.user_id.is_empty() {
        return reply(StatusCode::BAD_REQUEST, Some("missing_team_or_user"));
    }

    match state.dispatcher.handle_inbound(request).await {
        Ok(()) => reply(StatusCode::OK, None),
        Err(err) if err.is_permanent() => {
            warn!(error = %err, "inbound relay rejected");
            reply(StatusCode::BAD_REQUEST, Some(err.code()))
        },
        Err(err) => {
            // Retryable class: the upstream delivery system redelivers.
            warn!(error = %err, "inbound relay failed; requesting redelivery");
            reply(StatusCode::SERVICE_UNAVAILABLE, Some("retry"))
        },
    }
}
