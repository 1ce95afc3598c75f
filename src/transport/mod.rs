//! Non-blocking socket plumbing: readiness selection and the per-socket
//! message transport state machine.

mod link;
mod selector;

pub use link::{LinkError, MsgTransport};
pub use selector::{Readiness, Selector, SelectorError};
