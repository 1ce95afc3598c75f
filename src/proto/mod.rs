//! ANP wire protocol: tagged elements, framed messages, type-field layout.
//!
//! Wire format: 24-byte big-endian header (`major`, `minor`, `type`, `id`,
//! `payload_size`) followed by `payload_size` bytes of tagged elements.

use thiserror::Error;

mod element;
mod message;

pub use element::{Element, ElementTag};
pub use message::{Header, Msg, MsgType, parse_payload};

/// Protocol version stamped into message headers by the builders.
pub const PROTO_MAJOR: u32 = 1;
pub const PROTO_MINOR: u32 = 0;

/// Protocol family carried in the top 4 bits of the type field.
pub const FAMILY_ANP: u32 = 3;

/// Role values carried in bits 26..28 of the type field.
pub const ROLE_CMD: u32 = 0;
pub const ROLE_RES: u32 = 1;
pub const ROLE_EVT: u32 = 2;

/// Namespace reserved for the cancellation command. A CancelCmd carries the
/// id of the command to cancel and no elements.
pub const NS_CANCEL_CMD: u32 = 0x03FF_FFFF;

pub const HEADER_LEN: usize = 24;

/// Hard cap on the declared payload size. Enforced by the transport on
/// receive; the codec itself emits whatever it is given.
pub const MAX_PAYLOAD_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    #[error("malformed header: {reason}")]
    MalformedHeader { reason: String },
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },
    #[error("element type mismatch: requested {requested:?} got {actual:?}")]
    TypeMismatch {
        requested: ElementTag,
        actual: ElementTag,
    },
}
