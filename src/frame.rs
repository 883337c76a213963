//! Wire framing and the outbound envelope.
//!
//! Every frame crossing the transport is the same envelope-shaped structure
//! `{id, type, data, timestamp}`. The reserved `type` values [`TYPE_PING`],
//! [`TYPE_PONG`] and [`TYPE_ACK`] are protocol control frames and are
//! intercepted before application dispatch; everything else is an
//! application message.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Liveness probe sent by the heartbeat monitor.
pub const TYPE_PING: &str = "ping";
/// Remote reply to a ping, carrying the probe timestamp back.
pub const TYPE_PONG: &str = "pong";
/// Delivery confirmation for an ack-required message.
pub const TYPE_ACK: &str = "ack";

/// Timestamp in milliseconds since [`UNIX_EPOCH`].
pub(crate) type Timestamp = i64;

pub(crate) fn unix_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or_default()
}

/// A single frame on the wire.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub data: Value,
    pub timestamp: Timestamp,
}

impl Frame {
    /// Build a protocol-control frame (`ping`, `pong`, `ack`).
    #[must_use]
    pub fn control(frame_type: &str, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            frame_type: frame_type.to_owned(),
            data,
            timestamp: unix_millis(),
        }
    }

    #[must_use]
    pub fn is_control(&self) -> bool {
        matches!(self.frame_type.as_str(), TYPE_PING | TYPE_PONG | TYPE_ACK)
    }

    /// The envelope id an `ack` frame confirms.
    ///
    /// Acks carry the confirmed id in `data.id`; peers that echo the original
    /// frame id directly are accepted as well.
    #[must_use]
    pub fn acked_id(&self) -> Option<Uuid> {
        let raw = self
            .data
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or(&self.id);
        Uuid::parse_str(raw).ok()
    }
}

/// Delivery precedence tier. Governs queue ordering and eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub(crate) const COUNT: usize = 3;

    pub(crate) fn tier(self) -> usize {
        self as usize
    }
}

/// One outbound application message plus its delivery metadata.
///
/// Immutable except for `retries_remaining`, which is decremented exclusively
/// by the outbound send path when a transmission fails.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: Uuid,
    pub msg_type: String,
    pub payload: Value,
    pub enqueued_at: Instant,
    /// Insertion sequence number; deterministic tie-break within a tier.
    pub(crate) seq: u64,
    pub priority: Priority,
    pub retries_remaining: u32,
}

impl Envelope {
    pub(crate) fn new(
        seq: u64,
        msg_type: String,
        payload: Value,
        priority: Priority,
        retries: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            msg_type,
            payload,
            enqueued_at: Instant::now(),
            seq,
            priority,
            retries_remaining: retries,
        }
    }

    pub(crate) fn to_frame(&self) -> Frame {
        Frame {
            id: self.id.to_string(),
            frame_type: self.msg_type.clone(),
            data: self.payload.clone(),
            timestamp: unix_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn frame_serializes_with_type_key() {
        let frame = Frame::control(TYPE_PING, json!({"ts": 1}));
        let text = serde_json::to_string(&frame).expect("serialize");

        assert!(text.contains("\"type\":\"ping\""));
        assert!(!text.contains("frame_type"));
    }

    #[test]
    fn frame_data_defaults_to_null() {
        let frame: Frame =
            serde_json::from_str(r#"{"id":"x","type":"pong","timestamp":0}"#).expect("parse");
        assert!(frame.data.is_null());
        assert!(frame.is_control());
    }

    #[test]
    fn ack_id_prefers_data_field() {
        let confirmed = Uuid::new_v4();
        let ack = Frame::control(TYPE_ACK, json!({"id": confirmed.to_string()}));
        assert_eq!(ack.acked_id(), Some(confirmed));
    }

    #[test]
    fn ack_id_falls_back_to_frame_id() {
        let confirmed = Uuid::new_v4();
        let ack = Frame {
            id: confirmed.to_string(),
            frame_type: TYPE_ACK.to_owned(),
            data: Value::Null,
            timestamp: 0,
        };
        assert_eq!(ack.acked_id(), Some(confirmed));
    }

    #[test]
    fn priority_orders_low_to_high() {
        assert!(Priority::Low < Priority::Normal);
        assert!(Priority::Normal < Priority::High);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
