use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Gateway operation code.
///
/// Serialized as the numeric `op` field of the wire envelope. Codes the
/// client never produces or consumes deserialize into [`Opcode::Unknown`]
/// for forward compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Server event; carries `t`, `d`, and `s`.
    Dispatch,
    /// Keep-alive, sent both ways. Payload is the last known sequence.
    Heartbeat,
    /// Full handshake establishing a new session.
    Identify,
    /// Delivers a presence/activity update.
    PresenceUpdate,
    /// Abbreviated handshake continuing an interrupted session.
    Resume,
    /// Server requests a fresh reconnect cycle.
    Reconnect,
    /// Session is no longer valid; the client must re-identify.
    InvalidSession,
    /// First message after the socket opens; carries the heartbeat interval.
    Hello,
    /// Server acknowledgement of a client heartbeat.
    HeartbeatAck,
    /// Any code this client does not understand.
    Unknown(u8),
}

impl Opcode {
    /// Returns the numeric wire code.
    pub fn code(self) -> u8 {
        match self {
            Opcode::Dispatch => 0,
            Opcode::Heartbeat => 1,
            Opcode::Identify => 2,
            Opcode::PresenceUpdate => 3,
            Opcode::Resume => 6,
            Opcode::Reconnect => 7,
            Opcode::InvalidSession => 9,
            Opcode::Hello => 10,
            Opcode::HeartbeatAck => 11,
            Opcode::Unknown(code) => code,
        }
    }

    /// Maps a numeric wire code to an opcode.
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Opcode::Dispatch,
            1 => Opcode::Heartbeat,
            2 => Opcode::Identify,
            3 => Opcode::PresenceUpdate,
            6 => Opcode::Resume,
            7 => Opcode::Reconnect,
            9 => Opcode::InvalidSession,
            10 => Opcode::Hello,
            11 => Opcode::HeartbeatAck,
            other => Opcode::Unknown(other),
        }
    }
}

impl Serialize for Opcode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for Opcode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Opcode::from_code(u8::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_roundtrip() {
        for op in [
            Opcode::Dispatch,
            Opcode::Heartbeat,
            Opcode::Identify,
            Opcode::PresenceUpdate,
            Opcode::Resume,
            Opcode::Reconnect,
            Opcode::InvalidSession,
            Opcode::Hello,
            Opcode::HeartbeatAck,
        ] {
            assert_eq!(Opcode::from_code(op.code()), op);
        }
    }

    #[test]
    fn serializes_as_number() {
        assert_eq!(serde_json::to_string(&Opcode::Hello).unwrap(), "10");
        assert_eq!(serde_json::to_string(&Opcode::Dispatch).unwrap(), "0");
    }

    #[test]
    fn deserializes_from_number() {
        let op: Opcode = serde_json::from_str("2").unwrap();
        assert_eq!(op, Opcode::Identify);
    }

    #[test]
    fn unknown_code_preserved() {
        let op: Opcode = serde_json::from_str("42").unwrap();
        assert_eq!(op, Opcode::Unknown(42));
        assert_eq!(serde_json::to_string(&op).unwrap(), "42");
    }
}
