//! Wire protocol for the presence gateway.
//!
//! Pure data, no I/O: the `{op, d, s, t}` frame envelope, numeric
//! opcodes, handshake payloads, and the presence/activity value objects.

pub mod event;
pub mod frame;
pub mod opcode;
pub mod payloads;
pub mod presence;

pub use event::GatewayEvent;
pub use frame::Frame;
pub use opcode::Opcode;
pub use payloads::{Hello, Identify, IdentifyProperties, Ready, Resume};
pub use presence::{Presence, PresenceUpdate};
