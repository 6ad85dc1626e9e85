//! Typed dispatch events.
//!
//! Dispatch frames carry an open-ended event name in `t`; the connection
//! only cares about a small closed set, so the codec maps names into
//! [`GatewayEvent`] here instead of scattering string matches around.

use crate::frame::Frame;
use crate::opcode::Opcode;
use crate::payloads::Ready;

/// A dispatch event the connection knows how to handle.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A new session is established.
    Ready(Ready),
    /// An interrupted session was resumed.
    Resumed,
    /// Any other event; carried by name and otherwise ignored.
    Unknown(String),
}

impl Frame {
    /// Classifies this frame's dispatch event.
    ///
    /// Returns `None` for non-dispatch frames, and an error only when a
    /// known event's payload fails to decode.
    pub fn event(&self) -> Result<Option<GatewayEvent>, serde_json::Error> {
        if self.op != Opcode::Dispatch {
            return Ok(None);
        }
        let name = self.t.as_deref().unwrap_or_default();
        let event = match name {
            "READY" => match self.parse_payload::<Ready>()? {
                Some(ready) => GatewayEvent::Ready(ready),
                None => GatewayEvent::Unknown(name.to_string()),
            },
            "RESUMED" => GatewayEvent::Resumed,
            other => GatewayEvent::Unknown(other.to_string()),
        };
        Ok(Some(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_event_parsed() {
        let json = r#"{"op":0,"d":{"session_id":"abc","resume_gateway_url":"wss://r.example"},"s":1,"t":"READY"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        match frame.event().unwrap() {
            Some(GatewayEvent::Ready(ready)) => {
                assert_eq!(ready.session_id, "abc");
                assert_eq!(ready.resume_gateway_url.as_deref(), Some("wss://r.example"));
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn resumed_event_parsed() {
        let json = r#"{"op":0,"s":5,"t":"RESUMED"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.event().unwrap(), Some(GatewayEvent::Resumed));
    }

    #[test]
    fn unknown_event_carried_by_name() {
        let json = r#"{"op":0,"d":{},"s":2,"t":"PRESENCE_UPDATE"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(
            frame.event().unwrap(),
            Some(GatewayEvent::Unknown("PRESENCE_UPDATE".into()))
        );
    }

    #[test]
    fn non_dispatch_frame_has_no_event() {
        let json = r#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.event().unwrap(), None);
    }

    #[test]
    fn ready_without_payload_is_unknown() {
        let json = r#"{"op":0,"s":1,"t":"READY"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(
            frame.event().unwrap(),
            Some(GatewayEvent::Unknown("READY".into()))
        );
    }
}
