//! LSNP protocol core.
//! Host-driven: no I/O; host passes datagrams and ticks, receives actions.

pub mod chunk;
pub mod config;
pub mod core;
pub mod delivery;
pub mod identity;
pub mod integrity;
pub mod peers;
pub mod protocol;
pub mod token;
pub mod transfer;
pub mod wire;

pub use config::CoreConfig;
pub use crate::core::{CoreEvent, Destination, Disposition, LsnpCore, OutboundAction, SendError};
pub use identity::{LocalProfile, UserId};
pub use protocol::{field, MessageKind, LSNP_PORT};
pub use token::Scope;
pub use wire::{decode_envelope, encode_envelope, DecodeError, EncodeError, Envelope};
