use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BrokerError, Result};
use crate::queue::QueueName;

/// Request body carried on every queue: the tenant plus the action payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T = serde_json::Value> {
    /// Tenant whose state the handler must load first
    pub subdomain: String,
    /// Handler-specific payload, opaque to the transport
    pub data: T,
}

impl<T> Envelope<T> {
    /// Create an envelope, rejecting a missing tenant.
    pub fn new(subdomain: impl Into<String>, data: T) -> Result<Self> {
        let subdomain = subdomain.into();
        if subdomain.trim().is_empty() {
            return Err(BrokerError::MissingTenant);
        }
        Ok(Self { subdomain, data })
    }
}

impl<T: Serialize> Envelope<T> {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Envelope<serde_json::Value> {
    /// Decode a raw request body, enforcing the single-tenant invariant.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if envelope.subdomain.trim().is_empty() {
            return Err(BrokerError::MissingTenant);
        }
        Ok(envelope)
    }

    /// Deserialize payload to specific type
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Answer to an RPC request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    Success {
        #[serde(default)]
        data: serde_json::Value,
    },
    Error {
        #[serde(rename = "errorMessage")]
        error_message: String,
    },
}

impl Reply {
    /// Create a successful reply
    pub fn success(data: impl Serialize) -> Result<Self> {
        Ok(Self::Success {
            data: serde_json::to_value(data)?,
        })
    }

    /// Create an error reply
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error_message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A message handed to the transport: body plus routing properties
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    /// Correlates a reply with its pending request
    pub correlation_id: Option<Uuid>,
    /// Queue the consumer must answer on; set only for RPC requests
    pub reply_to: Option<QueueName>,
}

impl OutboundMessage {
    /// Fire-and-forget request
    pub fn event(body: Vec<u8>) -> Self {
        Self {
            body,
            correlation_id: None,
            reply_to: None,
        }
    }

    pub fn request(body: Vec<u8>, correlation_id: Uuid, reply_to: QueueName) -> Self {
        Self {
            body,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
        }
    }

    pub fn reply(body: Vec<u8>, correlation_id: Uuid) -> Self {
        Self {
            body,
            correlation_id: Some(correlation_id),
            reply_to: None,
        }
    }
}

/// A message received from the transport
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub body: Vec<u8>,
    pub correlation_id: Option<Uuid>,
    pub reply_to: Option<QueueName>,
}

impl InboundMessage {
    /// Whether the publisher is waiting for an answer
    pub fn expects_reply(&self) -> bool {
        self.correlation_id.is_some() && self.reply_to.is_some()
    }
}

impl From<OutboundMessage> for InboundMessage {
    fn from(message: OutboundMessage) -> Self {
        Self {
            body: message.body,
            correlation_id: message.correlation_id,
            reply_to: message.reply_to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::new("acme", json!({ "n": 1 })).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(value, json!({ "subdomain": "acme", "data": { "n": 1 } }));
    }

    #[test]
    fn test_envelope_requires_tenant() {
        assert!(matches!(
            Envelope::new("", 1),
            Err(BrokerError::MissingTenant)
        ));
        let raw = br#"{"subdomain":"","data":null}"#;
        assert!(matches!(
            Envelope::from_bytes(raw),
            Err(BrokerError::MissingTenant)
        ));
    }

    #[test]
    fn test_reply_wire_format() {
        let ok = serde_json::to_value(Reply::success(json!({ "n": 2 })).unwrap()).unwrap();
        assert_eq!(ok, json!({ "status": "success", "data": { "n": 2 } }));

        let err = serde_json::to_value(Reply::error("X")).unwrap();
        assert_eq!(err, json!({ "status": "error", "errorMessage": "X" }));
    }

    #[test]
    fn test_success_reply_without_data() {
        let reply = Reply::from_bytes(br#"{"status":"success"}"#).unwrap();
        assert_eq!(reply, Reply::Success { data: serde_json::Value::Null });
    }

    #[test]
    fn test_typed_payload() {
        #[derive(Deserialize)]
        struct Query {
            content_type: String,
        }

        let envelope = Envelope::from_bytes(br#"{"subdomain":"acme","data":{"content_type":"deal"}}"#).unwrap();
        let query: Query = envelope.payload().unwrap();
        assert_eq!(query.content_type, "deal");
    }
}
