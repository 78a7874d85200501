//! Messages exchanged with the broker
//!
//! A [`Message`] owns its payload outright. Every accessor hands out a copy and
//! every setter copies its input, so two holders of a message can never observe
//! each other's mutations through a shared buffer.

use serde::{Deserialize, Serialize};

/// Delivery guarantee requested for a publish or subscription.
///
/// The numeric identifiers (0/1/2) are passed through to the transport as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    /// Wire identifier of this level
    pub fn as_u8(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for Qos {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(other),
        }
    }
}

/// Error codes carried by rejected shadow acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    PayloadTooLarge,
    UnsupportedMediaType,
    TooManyRequests,
    InternalServiceFailure,
}

impl ShadowErrorCode {
    /// Numeric value used on the wire
    pub fn code(self) -> u16 {
        match self {
            ShadowErrorCode::BadRequest => 400,
            ShadowErrorCode::Unauthorized => 401,
            ShadowErrorCode::Forbidden => 403,
            ShadowErrorCode::NotFound => 404,
            ShadowErrorCode::Conflict => 409,
            ShadowErrorCode::PayloadTooLarge => 413,
            ShadowErrorCode::UnsupportedMediaType => 415,
            ShadowErrorCode::TooManyRequests => 429,
            ShadowErrorCode::InternalServiceFailure => 500,
        }
    }

    /// Map a numeric code back to a known variant, `None` for unknown codes
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            400 => Some(ShadowErrorCode::BadRequest),
            401 => Some(ShadowErrorCode::Unauthorized),
            403 => Some(ShadowErrorCode::Forbidden),
            404 => Some(ShadowErrorCode::NotFound),
            409 => Some(ShadowErrorCode::Conflict),
            413 => Some(ShadowErrorCode::PayloadTooLarge),
            415 => Some(ShadowErrorCode::UnsupportedMediaType),
            429 => Some(ShadowErrorCode::TooManyRequests),
            500 => Some(ShadowErrorCode::InternalServiceFailure),
            _ => None,
        }
    }
}

/// A message published to, or received from, a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    qos: Qos,
    payload: Option<Vec<u8>>,
    error_code: Option<ShadowErrorCode>,
    error_message: Option<String>,
}

impl Message {
    /// Create a message without payload
    pub fn new(topic: impl Into<String>, qos: Qos) -> Self {
        Self {
            topic: topic.into(),
            qos,
            payload: None,
            error_code: None,
            error_message: None,
        }
    }

    /// Create a message carrying a copy of `payload`
    pub fn with_payload(topic: impl Into<String>, qos: Qos, payload: impl AsRef<[u8]>) -> Self {
        let mut message = Self::new(topic, qos);
        message.set_payload(payload.as_ref());
        message
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn set_topic(&mut self, topic: impl Into<String>) {
        self.topic = topic.into();
    }

    pub fn qos(&self) -> Qos {
        self.qos
    }

    pub fn set_qos(&mut self, qos: Qos) {
        self.qos = qos;
    }

    /// Copy of the payload bytes
    pub fn payload(&self) -> Option<Vec<u8>> {
        self.payload.clone()
    }

    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Replace the payload with a copy of `payload`
    pub fn set_payload(&mut self, payload: &[u8]) {
        self.payload = Some(payload.to_vec());
    }

    pub fn clear_payload(&mut self) {
        self.payload = None;
    }

    /// Payload decoded as UTF-8, invalid sequences replaced
    pub fn string_payload(&self) -> Option<String> {
        self.payload
            .as_deref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn set_string_payload(&mut self, payload: &str) {
        self.set_payload(payload.as_bytes());
    }

    pub fn error_code(&self) -> Option<ShadowErrorCode> {
        self.error_code
    }

    pub fn set_error_code(&mut self, code: Option<ShadowErrorCode>) {
        self.error_code = code;
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn set_error_message(&mut self, message: Option<String>) {
        self.error_message = message;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_copied_out() {
        let mut message = Message::new("sensor/1", Qos::AtLeastOnce);
        let input = vec![1u8, 2, 3];
        message.set_payload(&input);

        let mut out = message.payload().unwrap();
        assert_eq!(out, input);

        out[0] = 42;
        assert_eq!(message.payload().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_payload_setter_copies_input() {
        let mut input = b"hello".to_vec();
        let message = Message::with_payload("t", Qos::AtMostOnce, &input);
        input[0] = b'j';
        assert_eq!(message.string_payload().as_deref(), Some("hello"));
    }

    #[test]
    fn test_clone_does_not_share_payload() {
        let original = Message::with_payload("t", Qos::AtMostOnce, "abc");
        let mut copy = original.clone();
        copy.set_string_payload("xyz");
        assert_eq!(original.string_payload().as_deref(), Some("abc"));
        assert_eq!(copy.string_payload().as_deref(), Some("xyz"));
    }

    #[test]
    fn test_message_without_payload() {
        let message = Message::new("t", Qos::AtMostOnce);
        assert!(!message.has_payload());
        assert!(message.payload().is_none());
        assert!(message.string_payload().is_none());
    }

    #[test]
    fn test_qos_conversion() {
        for qos in [Qos::AtMostOnce, Qos::AtLeastOnce, Qos::ExactlyOnce] {
            assert_eq!(Qos::try_from(qos.as_u8()), Ok(qos));
        }
        assert_eq!(Qos::try_from(3), Err(3));
        assert_eq!(Qos::default(), Qos::AtMostOnce);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ShadowErrorCode::from_code(409), Some(ShadowErrorCode::Conflict));
        assert_eq!(ShadowErrorCode::NotFound.code(), 404);
        assert_eq!(ShadowErrorCode::InternalServiceFailure.code(), 500);
        assert_eq!(ShadowErrorCode::from_code(418), None);
    }
}
