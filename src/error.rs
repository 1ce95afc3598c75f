//! Protocol-level error taxonomy.
//!
//! `ServiceError` is the error shape carried end to end: channels close with
//! one, queries complete with one, and peers exchange them inside messages
//! as `u32 kind, string message` plus a kind-specific trailer.

use thiserror::Error;

use crate::proto::{CodecError, Element, Msg};

/// Sub-kind trailer of [`ServiceErrorKind::QuotaExceeded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum QuotaKind {
    #[default]
    Generic,
    WorkspaceFile,
    SecureWorkspace,
}

impl QuotaKind {
    fn wire_value(self) -> u32 {
        match self {
            QuotaKind::Generic => 0,
            QuotaKind::WorkspaceFile => 1,
            QuotaKind::SecureWorkspace => 2,
        }
    }

    fn from_wire(value: u32) -> Result<Self, CodecError> {
        match value {
            0 => Ok(QuotaKind::Generic),
            1 => Ok(QuotaKind::WorkspaceFile),
            2 => Ok(QuotaKind::SecureWorkspace),
            other => Err(CodecError::MalformedPayload {
                reason: format!("unknown quota sub-kind {other}"),
            }),
        }
    }
}

/// Error kinds carried through the whole stack. Wire values are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ServiceErrorKind {
    Generic,
    /// User-initiated.
    Cancelled,
    /// System-initiated (broker shutdown).
    Interrupted,
    /// An incompatible operation is already in progress.
    Concurrent,
    /// Remote transport connection lost.
    KcdConn,
    /// Local transport connection lost.
    EAnpConn,
    InvalidKpsConfig,
    InvalidKwsLoginPwd,
    PermDenied,
    QuotaExceeded(QuotaKind),
    /// Client too old.
    UpgradeKwm,
}

impl ServiceErrorKind {
    pub fn wire_value(self) -> u32 {
        match self {
            ServiceErrorKind::Generic => 0,
            ServiceErrorKind::Cancelled => 1,
            ServiceErrorKind::Interrupted => 2,
            ServiceErrorKind::Concurrent => 3,
            ServiceErrorKind::KcdConn => 4,
            ServiceErrorKind::EAnpConn => 5,
            ServiceErrorKind::InvalidKpsConfig => 6,
            ServiceErrorKind::InvalidKwsLoginPwd => 7,
            ServiceErrorKind::PermDenied => 8,
            ServiceErrorKind::QuotaExceeded(_) => 9,
            ServiceErrorKind::UpgradeKwm => 10,
        }
    }
}

/// An error as seen by broker users and by the peer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: ServiceErrorKind, message: impl Into<String>) -> Self {
        ServiceError {
            kind,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Generic, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::Cancelled, message)
    }

    pub fn interrupted() -> Self {
        Self::new(ServiceErrorKind::Interrupted, "interrupted")
    }

    pub fn conn_lost(message: impl Into<String>) -> Self {
        Self::new(ServiceErrorKind::EAnpConn, message)
    }

    /// Append this error's wire representation to a message.
    pub fn encode_onto(&self, msg: &mut Msg) {
        msg.push(Element::U32(self.kind.wire_value()));
        msg.push(Element::Str(self.message.clone().into_bytes()));
        if let ServiceErrorKind::QuotaExceeded(sub) = self.kind {
            msg.push(Element::U32(sub.wire_value()));
        }
    }

    /// Decode an error from the elements written by [`Self::encode_onto`].
    pub fn decode_from(elements: &[Element]) -> Result<ServiceError, CodecError> {
        let missing = |what: &str| CodecError::MalformedPayload {
            reason: format!("error payload missing {what}"),
        };
        let kind_value = elements.first().ok_or_else(|| missing("kind"))?.as_u32()?;
        let message = elements.get(1).ok_or_else(|| missing("message"))?.as_str()?;
        let kind = match kind_value {
            0 => ServiceErrorKind::Generic,
            1 => ServiceErrorKind::Cancelled,
            2 => ServiceErrorKind::Interrupted,
            3 => ServiceErrorKind::Concurrent,
            4 => ServiceErrorKind::KcdConn,
            5 => ServiceErrorKind::EAnpConn,
            6 => ServiceErrorKind::InvalidKpsConfig,
            7 => ServiceErrorKind::InvalidKwsLoginPwd,
            8 => ServiceErrorKind::PermDenied,
            9 => {
                let sub = elements
                    .get(2)
                    .ok_or_else(|| missing("quota sub-kind"))?
                    .as_u32()?;
                ServiceErrorKind::QuotaExceeded(QuotaKind::from_wire(sub)?)
            }
            10 => ServiceErrorKind::UpgradeKwm,
            other => {
                return Err(CodecError::MalformedPayload {
                    reason: format!("unknown error kind {other}"),
                });
            }
        };
        Ok(ServiceError {
            kind,
            message: String::from_utf8_lossy(message).into_owned(),
        })
    }
}
