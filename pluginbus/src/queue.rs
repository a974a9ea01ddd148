//! Queue naming shared by every publisher and consumer.
//!
//! A queue is addressed as `"<service>:<action>"`. Neither half may contain
//! the separator, so two different pairs can never produce the same name.
//! Changing this format is a wire-breaking change.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BrokerError, Result};

pub const SEPARATOR: char = ':';

const REPLY_PREFIX: &str = "reply.";

/// Name of a broker queue
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(String);

impl QueueName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Private reply queue for one process. The uuid keeps two instances of
    /// the same plugin from reading each other's replies.
    pub fn reply_queue(owner: &str) -> Result<Self> {
        validate_part("service", owner)?;
        Ok(Self(format!(
            "{}{}{}{}",
            owner,
            SEPARATOR,
            REPLY_PREFIX,
            Uuid::new_v4().simple()
        )))
    }

    /// Wrap a name received from the wire (a `reply_to` property).
    pub fn from_wire(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(BrokerError::InvalidQueueName {
                reason: "empty queue name".to_string(),
            });
        }
        Ok(Self(raw))
    }

    /// Split back into `(service, action)`.
    pub fn parts(&self) -> Option<(&str, &str)> {
        self.0.split_once(SEPARATOR)
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Queue that carries `action` messages for `service`.
pub fn queue_name_for(service: &str, action: &str) -> Result<QueueName> {
    validate_part("service", service)?;
    validate_part("action", action)?;
    Ok(QueueName(format!("{}{}{}", service, SEPARATOR, action)))
}

fn validate_part(kind: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(BrokerError::InvalidQueueName {
            reason: format!("{} name is empty", kind),
        });
    }
    if value.contains(SEPARATOR) {
        return Err(BrokerError::InvalidQueueName {
            reason: format!("{} name '{}' contains '{}'", kind, value, SEPARATOR),
        });
    }
    if value.chars().any(char::is_whitespace) {
        return Err(BrokerError::InvalidQueueName {
            reason: format!("{} name '{}' contains whitespace", kind, value),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_queue_name_format() {
        let queue = queue_name_for("ebarimt", "putresponses.find").unwrap();
        assert_eq!(queue.as_str(), "ebarimt:putresponses.find");
        assert_eq!(queue.parts(), Some(("ebarimt", "putresponses.find")));
    }

    #[test]
    fn test_queue_name_is_deterministic() {
        let a = queue_name_for("facebook", "afterMutation").unwrap();
        let b = queue_name_for("facebook", "afterMutation").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_queue_name_is_injective() {
        let services = ["core", "cards", "core.cards", "a", "ab"];
        let actions = ["find", "cards.find", "b", "ab.c", "x"];

        let mut seen = HashSet::new();
        for service in services {
            for action in actions {
                let queue = queue_name_for(service, action).unwrap();
                assert!(seen.insert(queue), "collision for {}/{}", service, action);
            }
        }
    }

    #[test]
    fn test_rejects_malformed_parts() {
        assert!(queue_name_for("", "ping").is_err());
        assert!(queue_name_for("core", "").is_err());
        assert!(queue_name_for("core:x", "ping").is_err());
        assert!(queue_name_for("core", "a:b").is_err());
        assert!(queue_name_for("core", "pi ng").is_err());
    }

    #[test]
    fn test_reply_queues_are_unique() {
        let a = QueueName::reply_queue("facebook").unwrap();
        let b = QueueName::reply_queue("facebook").unwrap();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("facebook:reply."));
    }
}
