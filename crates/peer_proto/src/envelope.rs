//! The wire envelope: JSON-encoded, one per frame.
//!
//! Requests and responses are correlated by `corr` carrying the request's
//! `id`; events reuse `key` as the topic name.

use serde::{Deserialize, Serialize};

use crate::payload::Payload;

/// Response status set by the responding side.
pub const STATUS_DELIVERED: &str = "delivered";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Request,
    Response,
    Event,
    Hello,
    Subscribe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message id; requests are correlated on it.
    pub id: String,
    pub kind: Kind,
    /// Sender peer id.
    pub source: String,
    /// RPC key for requests/responses, topic name for events.
    pub key: String,
    /// For responses: the `id` of the request being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub payload: Payload,
}

impl Envelope {
    fn base(kind: Kind, source: &str, key: &str, payload: Payload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            source: source.to_string(),
            key: key.to_string(),
            corr: None,
            status: None,
            payload,
        }
    }

    pub fn request(source: &str, key: &str, payload: Payload) -> Self {
        Self::base(Kind::Request, source, key, payload)
    }

    pub fn response(source: &str, key: &str, corr: &str, payload: Payload) -> Self {
        let mut env = Self::base(Kind::Response, source, key, payload);
        env.corr = Some(corr.to_string());
        env.status = Some(STATUS_DELIVERED.to_string());
        env
    }

    pub fn event(source: &str, topic: &str, payload: Payload) -> Self {
        Self::base(Kind::Event, source, topic, payload)
    }

    pub fn hello(source: &str, payload: Payload) -> Self {
        Self::base(Kind::Hello, source, "hello", payload)
    }

    pub fn subscribe(source: &str, payload: Payload) -> Self {
        Self::base(Kind::Subscribe, source, "subscribe", payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::normalize;
    use serde_json::json;

    #[test]
    fn request_gets_unique_ids() {
        let a = Envelope::request("alpha", "echo", Payload::new());
        let b = Envelope::request("alpha", "echo", Payload::new());
        assert_ne!(a.id, b.id);
        assert_eq!(a.kind, Kind::Request);
        assert!(a.corr.is_none());
    }

    #[test]
    fn response_carries_correlation_and_status() {
        let req = Envelope::request("alpha", "echo", normalize(json!({"t0": 1.0})));
        let resp = Envelope::response("beta", "echo", &req.id, normalize(json!({"t1": 2.0})));
        assert_eq!(resp.corr.as_deref(), Some(req.id.as_str()));
        assert_eq!(resp.status.as_deref(), Some(STATUS_DELIVERED));
    }

    #[test]
    fn decode_survives_missing_optional_fields() {
        let raw = br#"{"id":"m1","kind":"event","source":"alpha","key":"alerts.status"}"#;
        let env = Envelope::decode(raw).unwrap();
        assert_eq!(env.kind, Kind::Event);
        assert!(env.payload.is_empty());
        assert!(env.status.is_none());
    }

    #[test]
    fn encode_uses_lowercase_kinds() {
        let env = Envelope::hello("alpha", Payload::new());
        let text = String::from_utf8(env.encode().unwrap()).unwrap();
        assert!(text.contains(r#""kind":"hello""#));
    }
}
