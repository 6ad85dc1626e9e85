use serde::{Deserialize, Serialize};

use crate::opcode::Opcode;

/// Envelope for all gateway traffic.
///
/// Every message on the wire is `{op, d, s?, t?}`. The `d` field uses
/// `serde_json::value::RawValue` to defer payload deserialization until
/// the opcode (and event name) are known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub op: Opcode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d: Option<Box<serde_json::value::RawValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl Frame {
    /// Creates a frame with the given opcode and payload.
    pub fn new<T: Serialize>(op: Opcode, payload: Option<&T>) -> Result<Self, serde_json::Error> {
        let d = match payload {
            Some(p) => {
                let json = serde_json::to_string(p)?;
                Some(serde_json::value::RawValue::from_string(json)?)
            }
            None => None,
        };
        Ok(Self {
            op,
            d,
            s: None,
            t: None,
        })
    }

    /// Creates a heartbeat frame carrying the last known sequence.
    ///
    /// Sequence 0 (nothing dispatched yet) serializes as `null`.
    pub fn heartbeat(seq: u64) -> Result<Self, serde_json::Error> {
        let payload = if seq > 0 {
            serde_json::Value::from(seq)
        } else {
            serde_json::Value::Null
        };
        Frame::new(Opcode::Heartbeat, Some(&payload))
    }

    /// Deserializes the payload into the given type.
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Option<T>, serde_json::Error> {
        match &self.d {
            Some(raw) => Ok(Some(serde_json::from_str(raw.get())?)),
            None => Ok(None),
        }
    }
}
