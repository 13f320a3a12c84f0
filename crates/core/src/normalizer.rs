use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::types::NormalizedEvent;

/// Errors that can occur while normalizing an inbound payload.
#[derive(Debug, Error)]
pub enum NormalizerError {
    #[error("no known payload shape matched")]
    UnknownShape,
}

/// Payload shapes the provider has shipped historically, in detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// JSON envelope `{id, event, data, sentDate}` with a nested `data` block.
    Envelope,
    /// `message` field carrying a nested JSON object.
    MessageObject,
    /// `message` field carrying a JSON-encoded string.
    MessageJson,
    /// `message` field carrying a query-string-encoded string.
    MessageQuery,
    /// Legacy flat form fields with the `trans_`/`cus_`/`product_` prefixes.
    FlatForm,
}

impl PayloadShape {
    /// Label used for logging which shape matched (values are never logged).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Envelope => "envelope",
            Self::MessageObject => "message_object",
            Self::MessageJson => "message_json",
            Self::MessageQuery => "message_query",
            Self::FlatForm => "flat_form",
        }
    }
}

/// Deterministic normalizer turning heterogeneous provider payloads into
/// [`NormalizedEvent`] values.
///
/// Shapes are tried in a fixed priority order and the first usable one wins.
/// A missing email is not an error here: the event is still returned so the
/// caller can log it, it just never mutates entitlement state.
pub struct Normalizer;

impl Normalizer {
    /// Normalizes a parsed payload. `received_at` seeds the synthesized
    /// event id when the payload carries no identifier of its own.
    pub fn normalize(
        payload: &Value,
        received_at: DateTime<Utc>,
    ) -> Result<(NormalizedEvent, PayloadShape), NormalizerError> {
        let root = payload.as_object().ok_or(NormalizerError::UnknownShape)?;
        let (shape, data) = detect_shape(root)?;

        let event = pick_string(payload, &[&["event"]])
            .or_else(|| pick_string(&data, &[&["event"]]))
            .unwrap_or_default()
            .to_lowercase();

        let email = pick_string(
            &data,
            &[
                &["buyer", "email"],
                &["customer", "email"],
                &["user", "email"],
                &["email"],
                &["cus_email"],
            ],
        )
        .map(|value| value.trim().to_lowercase())
        .unwrap_or_default();

        let invoice_id = pick_string(
            &data,
            &[&["invoice", "id"], &["invoiceId"], &["trans_cod"], &["id"]],
        );
        let invoice_status = pick_string(
            &data,
            &[&["invoice", "status"], &["status"], &["trans_status"]],
        );
        let product_id = pick_string(
            &data,
            &[
                &["product", "id"],
                &["productId"],
                &["content", "id"],
                &["product_cod"],
            ],
        );
        let product_title = pick_string(
            &data,
            &[
                &["product", "title"],
                &["productTitle"],
                &["content", "title"],
                &["product_name"],
            ],
        );

        let event_id = pick_string(payload, &[&["id"]])
            .or_else(|| invoice_id.clone())
            .unwrap_or_else(|| synthesize_event_id(received_at));

        Ok((
            NormalizedEvent {
                event_id,
                event,
                email,
                invoice_id,
                invoice_status,
                product_id,
                product_title,
            },
            shape,
        ))
    }
}

/// Folds decoded form pairs into a JSON object so form-encoded bodies run
/// through the same shape detection as JSON ones.
pub fn form_to_value(pairs: Vec<(String, String)>) -> Value {
    let mut map = Map::new();
    for (key, value) in pairs {
        map.insert(key, Value::String(value));
    }
    Value::Object(map)
}

fn detect_shape(root: &Map<String, Value>) -> Result<(PayloadShape, Value), NormalizerError> {
    if let Some(data) = root.get("data") {
        let data = if data.is_object() {
            data.clone()
        } else {
            Value::Object(Map::new())
        };
        return Ok((PayloadShape::Envelope, data));
    }

    if let Some(message) = root.get("message") {
        match message {
            Value::Object(_) => return Ok((PayloadShape::MessageObject, message.clone())),
            Value::String(raw) => {
                if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                    if parsed.is_object() {
                        return Ok((PayloadShape::MessageJson, parsed));
                    }
                }
                if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(raw) {
                    if !pairs.is_empty() {
                        return Ok((PayloadShape::MessageQuery, form_to_value(pairs)));
                    }
                }
            }
            _ => {}
        }
    }

    let has_legacy_prefix = root.keys().any(|key| {
        key.starts_with("trans_") || key.starts_with("cus_") || key.starts_with("product_")
    });
    if has_legacy_prefix {
        return Ok((PayloadShape::FlatForm, Value::Object(root.clone())));
    }

    // Envelope without a data block: still identifiable, yields a record
    // with no extractable fields (logged only downstream).
    if root.contains_key("event") || root.contains_key("id") || root.contains_key("sentDate") {
        return Ok((PayloadShape::Envelope, Value::Object(Map::new())));
    }

    Err(NormalizerError::UnknownShape)
}

fn pick_string(value: &Value, paths: &[&[&str]]) -> Option<String> {
    for path in paths {
        let mut cursor = value;
        let mut found = true;
        for segment in *path {
            match cursor.get(segment) {
                Some(next) => cursor = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if !found {
            continue;
        }
        if let Some(text) = value_to_string(cursor) {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn synthesize_event_id(received_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}",
        received_at.timestamp_millis(),
        Uuid::new_v4().simple()
    )
}
