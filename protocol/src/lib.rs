//! Shared wire-format types between the gateway and anything that needs to
//! speak its JSON/binary protocols. No I/O, no tokio: pure types and pure
//! (de)coding functions only, mirroring how the relay's `protocol` crate
//! only carries message tags and the `JoinRequest` shape.

pub mod errors;
pub mod game;
pub mod messages;
pub mod wire;

pub use errors::ErrorCode;
pub use game::GameKind;
