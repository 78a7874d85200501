//! Shadow document helpers
//!
//! Shadow payloads are JSON objects. These helpers pull out the few fields the
//! protocol relies on (`version`, `state`, `clientToken`, rejection `code` and
//! `message`) and build report payloads. Anything unparseable is treated as
//! "field absent" rather than an error.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use thingsync_client::{Message, ShadowErrorCode};

const CLIENT_TOKEN: &str = "clientToken";

/// Build an update payload reporting `reported`, with `version` when versioning.
pub fn report_payload(version: Option<i64>, reported: &Map<String, Value>) -> String {
    let mut document = json!({ "state": { "reported": reported } });
    if let (Some(version), Some(object)) = (version, document.as_object_mut()) {
        object.insert("version".to_string(), json!(version));
    }
    document.to_string()
}

fn parse_object(payload: &[u8]) -> Option<Map<String, Value>> {
    match serde_json::from_slice::<Value>(payload).ok()? {
        Value::Object(object) => Some(object),
        _ => None,
    }
}

/// Top-level `version` of a shadow document
pub fn extract_version(payload: &[u8]) -> Option<i64> {
    parse_object(payload)?.get("version")?.as_i64()
}

/// Top-level `state` object (the delta body for delta messages)
pub fn extract_state(payload: &[u8]) -> Option<Map<String, Value>> {
    match parse_object(payload)?.remove("state")? {
        Value::Object(state) => Some(state),
        _ => None,
    }
}

pub fn extract_client_token(payload: &[u8]) -> Option<String> {
    parse_object(payload)?
        .get(CLIENT_TOKEN)?
        .as_str()
        .map(str::to_string)
}

/// Stamp `token` into a request payload.
///
/// A missing payload becomes `{"clientToken": token}`. Payloads that are not a
/// JSON object are returned unchanged as `None`, meaning "send as is".
pub fn with_client_token(payload: Option<&[u8]>, token: &str) -> Option<Vec<u8>> {
    let mut object = match payload {
        None => Map::new(),
        Some(bytes) if bytes.is_empty() => Map::new(),
        Some(bytes) => parse_object(bytes)?,
    };
    object.insert(CLIENT_TOKEN.to_string(), Value::String(token.to_string()));
    serde_json::to_vec(&Value::Object(object)).ok()
}

#[derive(Debug, Deserialize)]
struct Rejection {
    code: Option<u16>,
    message: Option<String>,
}

/// Code and reason of a rejected acknowledgement.
///
/// Falls back to code 0 and the raw payload text when the body is not a
/// rejection document.
pub fn rejection(payload: Option<&[u8]>) -> (u16, String) {
    let Some(bytes) = payload else {
        return (0, String::new());
    };

    match serde_json::from_slice::<Rejection>(bytes) {
        Ok(Rejection { code, message }) => (
            code.unwrap_or(0),
            message.unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned()),
        ),
        Err(_) => (0, String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Tag a rejected acknowledgement with the service's error code and reason.
///
/// Returns the raw code, which may be one [`ShadowErrorCode`] does not know.
pub fn annotate_rejection(message: &mut Message) -> u16 {
    let (code, reason) = rejection(message.payload().as_deref());
    message.set_error_code(ShadowErrorCode::from_code(code));
    message.set_error_message(Some(reason));
    code
}
