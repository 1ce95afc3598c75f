//! Outgoing and incoming query correlation objects.
//!
//! An outgoing query completes exactly once: with the peer's reply, with an
//! error when the channel closes, or silently when cancelled locally. An
//! incoming query is either replied to or fires its cancellation exactly
//! once.

use std::sync::{Arc, Mutex, Weak};

use crate::error::{ServiceError, ServiceErrorKind};
use crate::proto::{Msg, MsgType, NS_CANCEL_CMD};

use super::channel::ChannelShared;

type CompletionFn = Box<dyn FnOnce(&OutgoingQuery) + Send>;
type CancellationFn = Box<dyn FnOnce(&IncomingQuery) + Send>;

// ---------------------------------------------------------------------------
// Outgoing
// ---------------------------------------------------------------------------

struct OutgoingCore {
    cmd: Msg,
    reply: Option<Msg>,
    error: Option<ServiceError>,
    pending: bool,
    /// Completed by local cancel; the completion callback never fires.
    silent: bool,
    on_done: Option<CompletionFn>,
}

pub(crate) struct OutgoingShared {
    channel: Weak<ChannelShared>,
    cmd_id: u64,
    core: Mutex<OutgoingCore>,
}

impl OutgoingShared {
    pub(crate) fn new(channel: Weak<ChannelShared>, cmd: Msg) -> Arc<Self> {
        let cmd_id = cmd.id;
        Arc::new(OutgoingShared {
            channel,
            cmd_id,
            core: Mutex::new(OutgoingCore {
                cmd,
                reply: None,
                error: None,
                pending: true,
                silent: false,
                on_done: None,
            }),
        })
    }

    pub(crate) fn complete_with_reply(this: &Arc<Self>, reply: Msg) {
        let callback = {
            let mut core = this.core.lock().expect("query state poisoned");
            if !core.pending {
                return;
            }
            core.pending = false;
            core.reply = Some(reply);
            core.on_done.take()
        };
        if let Some(callback) = callback {
            callback(&OutgoingQuery {
                shared: Arc::clone(this),
            });
        }
    }

    pub(crate) fn complete_with_error(this: &Arc<Self>, error: ServiceError) {
        let callback = {
            let mut core = this.core.lock().expect("query state poisoned");
            if !core.pending {
                return;
            }
            core.pending = false;
            core.error = Some(error);
            core.on_done.take()
        };
        if let Some(callback) = callback {
            callback(&OutgoingQuery {
                shared: Arc::clone(this),
            });
        }
    }
}

/// Handle to a command awaiting its reply.
#[derive(Clone)]
pub struct OutgoingQuery {
    shared: Arc<OutgoingShared>,
}

impl OutgoingQuery {
    pub(crate) fn from_shared(shared: Arc<OutgoingShared>) -> Self {
        OutgoingQuery { shared }
    }

    /// The command id assigned on send.
    pub fn id(&self) -> u64 {
        self.shared.cmd_id
    }

    pub fn command(&self) -> Msg {
        self.shared
            .core
            .lock()
            .expect("query state poisoned")
            .cmd
            .clone()
    }

    pub fn is_pending(&self) -> bool {
        self.shared
            .core
            .lock()
            .expect("query state poisoned")
            .pending
    }

    pub fn reply(&self) -> Option<Msg> {
        self.shared
            .core
            .lock()
            .expect("query state poisoned")
            .reply
            .clone()
    }

    pub fn error(&self) -> Option<ServiceError> {
        self.shared
            .core
            .lock()
            .expect("query state poisoned")
            .error
            .clone()
    }

    /// Install the completion callback. Fires exactly once, immediately if
    /// the query already completed non-silently.
    pub fn on_completion(&self, callback: impl FnOnce(&OutgoingQuery) + Send + 'static) {
        let fire_now = {
            let mut core = self.shared.core.lock().expect("query state poisoned");
            if core.pending {
                core.on_done = Some(Box::new(callback));
                return;
            }
            !core.silent
        };
        if fire_now {
            callback(self);
        }
    }

    /// Cancel locally: sends a CancelCmd bearing this query's id and
    /// completes the query in the cancelled state without firing the
    /// completion callback.
    pub fn cancel(&self) {
        {
            let mut core = self.shared.core.lock().expect("query state poisoned");
            if !core.pending {
                return;
            }
            core.pending = false;
            core.silent = true;
            core.error = Some(ServiceError::cancelled("query cancelled"));
            core.on_done = None;
        }
        if let Some(channel) = self.shared.channel.upgrade() {
            channel.remove_outgoing(self.shared.cmd_id);
            let mut cancel = Msg::new(MsgType::command(NS_CANCEL_CMD));
            cancel.id = self.shared.cmd_id;
            channel.post_send(cancel);
        }
    }
}

// ---------------------------------------------------------------------------
// Incoming
// ---------------------------------------------------------------------------

struct IncomingCore {
    cmd: Msg,
    pending: bool,
    cancelled: bool,
    on_cancel: Option<CancellationFn>,
}

pub(crate) struct IncomingShared {
    channel: Weak<ChannelShared>,
    cmd_id: u64,
    core: Mutex<IncomingCore>,
}

impl IncomingShared {
    pub(crate) fn new(channel: Weak<ChannelShared>, cmd: Msg) -> Arc<Self> {
        let cmd_id = cmd.id;
        Arc::new(IncomingShared {
            channel,
            cmd_id,
            core: Mutex::new(IncomingCore {
                cmd,
                pending: true,
                cancelled: false,
                on_cancel: None,
            }),
        })
    }

    pub(crate) fn cmd_id(&self) -> u64 {
        self.cmd_id
    }

    pub(crate) fn fire_cancelled(this: &Arc<Self>) {
        let callback = {
            let mut core = this.core.lock().expect("query state poisoned");
            if !core.pending {
                return;
            }
            core.pending = false;
            core.cancelled = true;
            core.on_cancel.take()
        };
        if let Some(callback) = callback {
            callback(&IncomingQuery {
                shared: Arc::clone(this),
            });
        }
    }
}

/// Handle to a received command awaiting our reply.
#[derive(Clone)]
pub struct IncomingQuery {
    shared: Arc<IncomingShared>,
}

impl IncomingQuery {
    pub(crate) fn from_shared(shared: Arc<IncomingShared>) -> Self {
        IncomingQuery { shared }
    }

    /// The peer's command id; replies are correlated by it.
    pub fn id(&self) -> u64 {
        self.shared.cmd_id
    }

    pub fn command(&self) -> Msg {
        self.shared
            .core
            .lock()
            .expect("query state poisoned")
            .cmd
            .clone()
    }

    pub fn is_pending(&self) -> bool {
        self.shared
            .core
            .lock()
            .expect("query state poisoned")
            .pending
    }

    /// Install the cancellation callback. Fires at most once, immediately if
    /// cancellation already happened before installation.
    pub fn on_cancellation(&self, callback: impl FnOnce(&IncomingQuery) + Send + 'static) {
        let fire_now = {
            let mut core = self.shared.core.lock().expect("query state poisoned");
            if core.pending {
                core.on_cancel = Some(Box::new(callback));
                return;
            }
            core.cancelled
        };
        if fire_now {
            callback(self);
        }
    }

    /// Reply to the command. The command id is stamped into the reply before
    /// it is forwarded.
    pub fn reply(&self, mut msg: Msg) -> Result<(), ServiceError> {
        let Some(channel) = self.shared.channel.upgrade() else {
            return Err(ServiceError::conn_lost("channel closed"));
        };
        {
            let mut core = self.shared.core.lock().expect("query state poisoned");
            if !core.pending {
                return Err(ServiceError::new(
                    ServiceErrorKind::Concurrent,
                    "query already completed",
                ));
            }
            core.pending = false;
            core.on_cancel = None;
        }
        msg.id = self.shared.cmd_id;
        channel.remove_incoming(self.shared.cmd_id);
        channel.post_send(msg);
        Ok(())
    }
}
