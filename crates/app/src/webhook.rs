use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};
use uuid::Uuid;

use qbank_access_core::normalizer::{form_to_value, Normalizer};
use qbank_access_storage::{EntitlementChange, NewEventLog};

use crate::problem::ProblemResponse;
use crate::provisioning;
use crate::router::AppState;

const HEADER_SIGNATURE: &str = "x-signature";
const HEADER_TOKEN: &str = "x-webhook-token";
const ENTITLEMENT_SOURCE: &str = "webhook-provider";

/// GET probe some provider dashboards use to check the endpoint is alive.
pub async fn alive() -> Json<Value> {
    Json(json!({ "ok": true, "service": "delivery-webhook" }))
}

pub async fn handle(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let start = Instant::now();
    let response = match process(&state, &headers, &body).await {
        Ok(response) => response,
        Err(problem) => problem.into_response(),
    };
    histogram!("webhook_ack_latency_seconds").record(start.elapsed().as_secs_f64());
    response
}

async fn process(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response, ProblemResponse> {
    let Some(secret) = state.webhook_secret() else {
        error!(stage = "ingress", "webhook secret is not configured");
        return Err(ProblemResponse::internal(
            "configuration_error",
            "webhook secret is not configured",
        ));
    };

    let body_string = std::str::from_utf8(body).map_err(|_| {
        ProblemResponse::new(
            StatusCode::BAD_REQUEST,
            "invalid_payload",
            "request body must be valid UTF-8",
        )
    })?;

    let payload = parse_payload(body_string);

    match find_secret_carrier(&secret, headers, body, payload.as_ref()) {
        SecretVerdict::Missing => {
            // Providers probe delivery endpoints with unauthenticated pings.
            info!(stage = "ingress", "request carries no secret, ignoring");
            counter!("delivery_ingress_total", "outcome" => "ignored").increment(1);
            return Ok(Json(json!({ "ok": true, "ignored": true })).into_response());
        }
        SecretVerdict::Invalid(carrier) => {
            warn!(stage = "ingress", carrier = carrier.as_str(), "secret mismatch");
            counter!("delivery_invalid_secret_total", "carrier" => carrier.as_str()).increment(1);
            return Err(ProblemResponse::unauthorized(
                "invalid_secret",
                "webhook secret mismatch",
            ));
        }
        SecretVerdict::Valid(carrier) => {
            counter!("delivery_ingress_total", "outcome" => carrier.as_str()).increment(1);
        }
    }

    let received_at = state.now();

    let Some(payload) = payload else {
        record_raw(state, body_string, received_at, "unparseable").await?;
        warn!(stage = "normalizer", "payload is neither json nor form data");
        return Ok(warning_response("unparseable payload (event logged only)"));
    };

    let (event, shape) = match Normalizer::normalize(&payload, received_at) {
        Ok(result) => result,
        Err(err) => {
            record_raw(state, body_string, received_at, "unrecognized_shape").await?;
            warn!(stage = "normalizer", error = %err, "payload did not match any known shape");
            return Ok(warning_response(
                "unrecognized payload shape (event logged only)",
            ));
        }
    };

    let kind = event.kind();
    info!(
        stage = "normalizer",
        event_id = %event.event_id,
        shape = shape.as_str(),
        kind = kind.as_str(),
        "payload normalized"
    );

    let log_outcome = state
        .storage()
        .event_log()
        .record(NewEventLog {
            event_id: &event.event_id,
            received_at,
            event: &event.event,
            email: event.has_email().then_some(event.email.as_str()),
            invoice_id: event.invoice_id.as_deref(),
            invoice_status: event.invoice_status.as_deref(),
            product_id: event.product_id.as_deref(),
            product_title: event.product_title.as_deref(),
            payload_json: body_string,
        })
        .await
        .map_err(|err| {
            error!(stage = "ingress", event_id = %event.event_id, error = %err, "failed to record event");
            ProblemResponse::internal("storage_error", "failed to record event")
        })?;

    if log_outcome.is_replay() {
        // The merge below is idempotent, so replays reapply it instead of
        // short-circuiting.
        info!(stage = "ingress", event_id = %event.event_id, "replayed event id");
    }

    if !event.has_email() {
        warn!(stage = "reconcile", event_id = %event.event_id, "no email in payload");
        return Ok(warning_response("no email in payload (event logged only)"));
    }

    let uid = provisioning::resolve_uid(state.identity(), &event.email)
        .await
        .map_err(|err| {
            error!(stage = "identity", event_id = %event.event_id, error = %err, "failed to resolve identity");
            ProblemResponse::internal("identity_error", "failed to resolve identity for buyer")
        })?;

    let transition = kind.transition();
    let row = state
        .storage()
        .entitlements()
        .apply(EntitlementChange {
            uid: &uid,
            email: &event.email,
            active: transition.active,
            pending: transition.pending,
            source: ENTITLEMENT_SOURCE,
            product_id: event.product_id.as_deref(),
            product_title: event.product_title.as_deref(),
            invoice_id: event.invoice_id.as_deref(),
            invoice_status: event
                .invoice_status
                .as_deref()
                .or_else(|| kind.default_status()),
            last_event_id: &event.event_id,
            updated_at: received_at,
        })
        .await
        .map_err(|err| {
            error!(stage = "reconcile", event_id = %event.event_id, %uid, error = %err, "failed to apply entitlement");
            ProblemResponse::internal("storage_error", "failed to apply entitlement")
        })?;

    counter!("entitlement_transitions_total", "kind" => kind.as_str()).increment(1);
    info!(
        stage = "reconcile",
        event_id = %event.event_id,
        %uid,
        kind = kind.as_str(),
        active = row.active,
        pending = row.pending,
        "entitlement reconciled"
    );

    if transition.active && row.welcome_email_sent_at.is_none() {
        provisioning::send_welcome(state, &uid, &event.email).await;
    }

    Ok(Json(json!({ "ok": true, "uid": uid })).into_response())
}

/// Persists a payload that could not be normalized, under a synthesized id.
async fn record_raw(
    state: &AppState,
    body: &str,
    received_at: DateTime<Utc>,
    label: &str,
) -> Result<(), ProblemResponse> {
    let event_id = format!(
        "{}_{}",
        received_at.timestamp_millis(),
        Uuid::new_v4().simple()
    );
    state
        .storage()
        .event_log()
        .record(NewEventLog {
            event_id: &event_id,
            received_at,
            event: label,
            email: None,
            invoice_id: None,
            invoice_status: None,
            product_id: None,
            product_title: None,
            payload_json: body,
        })
        .await
        .map_err(|err| {
            error!(stage = "ingress", error = %err, "failed to record raw payload");
            ProblemResponse::internal("storage_error", "failed to record event")
        })?;
    Ok(())
}

fn warning_response(warning: &str) -> Response {
    Json(json!({ "ok": true, "warning": warning })).into_response()
}

fn parse_payload(body: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if value.is_object() {
            return Some(value);
        }
    }
    if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(body) {
        if !pairs.is_empty() {
            return Some(form_to_value(pairs));
        }
    }
    None
}

/// Ways a request can carry the shared secret, in the order they are tried.
#[derive(Debug, Clone, Copy)]
enum SecretCarrier {
    Signature,
    HeaderToken,
    BodyToken,
}

impl SecretCarrier {
    fn as_str(self) -> &'static str {
        match self {
            Self::Signature => "signature",
            Self::HeaderToken => "header_token",
            Self::BodyToken => "body_token",
        }
    }
}

enum SecretVerdict {
    Valid(SecretCarrier),
    Invalid(SecretCarrier),
    Missing,
}

/// The first carrier present decides the verdict; later carriers are never
/// consulted as fallbacks for a failed one.
fn find_secret_carrier(
    secret: &[u8],
    headers: &HeaderMap,
    body: &[u8],
    payload: Option<&Value>,
) -> SecretVerdict {
    if let Some(signature) = header_value(headers, HEADER_SIGNATURE) {
        return verdict(
            SecretCarrier::Signature,
            verify_signature(secret, body, signature),
        );
    }
    if let Some(token) = header_value(headers, HEADER_TOKEN) {
        return verdict(
            SecretCarrier::HeaderToken,
            constant_time_eq(secret, token.as_bytes()),
        );
    }
    if let Some(token) = body_token(payload) {
        return verdict(
            SecretCarrier::BodyToken,
            constant_time_eq(secret, token.as_bytes()),
        );
    }
    SecretVerdict::Missing
}

fn verdict(carrier: SecretCarrier, valid: bool) -> SecretVerdict {
    if valid {
        SecretVerdict::Valid(carrier)
    } else {
        SecretVerdict::Invalid(carrier)
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn body_token(payload: Option<&Value>) -> Option<&str> {
    let payload = payload?;
    payload
        .get("token")
        .or_else(|| payload.get("origin_secret"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn verify_signature(secret: &[u8], body: &[u8], provided: &str) -> bool {
    let hex_part = provided.strip_prefix("sha256=").unwrap_or(provided);
    let Ok(provided_bytes) = hex::decode(hex_part) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    expected.as_slice().ct_eq(provided_bytes.as_slice()).into()
}

fn constant_time_eq(secret: &[u8], provided: &[u8]) -> bool {
    secret.ct_eq(provided).into()
}
