//! Delivery envelope: a monotonic sequence number and emission timestamp stamped onto
//! every `BusEvent` before it reaches a delivery adapter.
//!
//! The generation record's `deliveryStatus` field is the durable delivery log (§4.H); this
//! envelope only gives adapters something to log and de-duplicate against, it is not itself
//! persisted.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::event::BusEvent;

/// Sequence + timestamp wrapper injected into the serialized event.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub sequence: u64,
    pub emitted_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(sequence: u64, emitted_at: DateTime<Utc>) -> Self {
        Self {
            sequence,
            emitted_at,
        }
    }

    /// Merges envelope fields into the given JSON object (top-level only); does not
    /// overwrite keys the event payload itself already set.
    pub fn inject_into(&self, obj: &mut Value) {
        let Some(obj) = obj.as_object_mut() else {
            return;
        };
        obj.entry("sequence")
            .or_insert_with(|| Value::Number(serde_json::Number::from(self.sequence)));
        obj.entry("emitted_at")
            .or_insert_with(|| Value::String(self.emitted_at.to_rfc3339()));
    }
}

/// Issues monotonically increasing sequence numbers for one bus subscriber; the notify
/// crate holds one of these per subscription so replays can detect gaps.
#[derive(Debug, Default)]
pub struct EnvelopeState {
    next_sequence: u64,
}

impl EnvelopeState {
    pub fn new() -> Self {
        Self { next_sequence: 0 }
    }

    fn next(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Serializes `event` and stamps it with the next sequence number and `now`.
    pub fn to_json(
        &mut self,
        event: &BusEvent,
        now: DateTime<Utc>,
    ) -> Result<Value, serde_json::Error> {
        let mut value = event.to_value()?;
        Envelope::new(self.next(), now).inject_into(&mut value);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_increments_per_event() {
        let mut state = EnvelopeState::new();
        let ev = BusEvent::CookProgress {
            cook_id: "c1".into(),
            generated_count: 1,
            target_count: 10,
            cost_usd: "0.01".into(),
        };
        let now = Utc::now();
        let first = state.to_json(&ev, now).unwrap();
        let second = state.to_json(&ev, now).unwrap();
        assert_eq!(first["sequence"], 0);
        assert_eq!(second["sequence"], 1);
    }

    #[test]
    fn inject_into_does_not_override_payload_fields() {
        let mut obj = serde_json::json!({"type": "cook_progress", "sequence": 99});
        Envelope::new(5, Utc::now()).inject_into(&mut obj);
        assert_eq!(obj["sequence"], 99);
    }
}
