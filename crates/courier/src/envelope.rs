//! The logical message envelope and typed payload helpers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CourierError, Result};

/// Wire-agnostic envelope: `{ id, type, payload, occurred_at }`.
///
/// The id is assigned when the outbox row is appended and travels unchanged to
/// the consumer, where it keys inbox deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub message_type: String,
    pub payload: Vec<u8>,
    pub occurred_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        message_type: impl Into<String>,
        payload: Vec<u8>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            payload,
            occurred_at,
        }
    }

    /// Whether this envelope carries a `M`.
    pub fn is<M: Message>(&self) -> bool {
        self.message_type == M::message_type()
    }

    /// Decode the JSON payload, checking the type tag first.
    pub fn decode<M: Message>(&self) -> Result<M> {
        if !self.is::<M>() {
            return Err(CourierError::invalid_message(format!(
                "expected message type {}, found {}",
                M::message_type(),
                self.message_type
            )));
        }
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// A typed message with a stable type tag.
///
/// Implement with the [`message_type!`](crate::message_type) macro.
pub trait Message: Serialize + DeserializeOwned + Send + Sync {
    fn message_type() -> &'static str;

    /// JSON-encode the message.
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_type;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct SomethingHappened {
        id: Uuid,
        source: String,
    }

    impl Message for SomethingHappened {
        message_type!("something-happened");
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SomethingElse;

    impl Message for SomethingElse {
        message_type!("something-else");
    }

    #[test]
    fn decode_checks_type_tag() {
        let event = SomethingHappened {
            id: Uuid::new_v4(),
            source: "publisher".into(),
        };
        let envelope = Envelope::new(
            SomethingHappened::message_type(),
            event.encode().unwrap(),
            Utc::now(),
        );

        assert!(envelope.is::<SomethingHappened>());
        assert_eq!(envelope.decode::<SomethingHappened>().unwrap(), event);

        let err = envelope.decode::<SomethingElse>().unwrap_err();
        assert!(matches!(err, CourierError::InvalidMessage { .. }));
    }

    #[test]
    fn decode_reports_malformed_payload() {
        let envelope = Envelope::new("something-happened", b"not json".to_vec(), Utc::now());
        let err = envelope.decode::<SomethingHappened>().unwrap_err();
        assert!(matches!(err, CourierError::Serialization(_)));
    }
}
