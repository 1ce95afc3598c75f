//! Owner-facing broker facade.
//!
//! The broker lives on the thread that called [`Broker::start`]. Worker
//! effects arrive through the dispatcher, so every listener callback runs on
//! the owner thread. Listeners may close or queue on the very channel an
//! event was fired for; events are queued and drained non-reentrantly.

mod channel;
mod query;

pub use channel::{Channel, ChannelListener};
pub use query::{IncomingQuery, OutgoingQuery};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::error::ServiceError;
use crate::proto::Msg;
use crate::worker::{self, WorkerLink, WorkerObserver, WorkerRole, WorkerState};

use self::channel::ChannelShared;

/// Broker lifecycle events, fired on the owner thread.
pub trait BrokerListener: Send {
    /// A channel reached the open state.
    fn channel_open(&mut self, channel: Channel);
    /// The worker exited. `None` means it was stopped by the owner.
    fn closed(&mut self, error: Option<ServiceError>);
}

enum Phase {
    Idle,
    Running {
        link: Arc<WorkerLink>,
        join: JoinHandle<()>,
    },
    Finished,
}

struct BrokerCore {
    phase: Phase,
    channels: HashMap<u64, Arc<ChannelShared>>,
}

enum BrokerEvent {
    ChannelOpen(Channel),
    Closed(Option<ServiceError>),
}

pub(crate) struct BrokerShared {
    mode: WorkerRole,
    config: Config,
    dispatcher: Arc<dyn Dispatcher>,
    core: Mutex<BrokerCore>,
    listener: Mutex<Option<Box<dyn BrokerListener>>>,
    events: Mutex<VecDeque<BrokerEvent>>,
    firing: AtomicBool,
    stopping: AtomicBool,
}

/// The user-facing broker. Clones share the same underlying broker.
#[derive(Clone)]
pub struct Broker {
    shared: Arc<BrokerShared>,
}

impl Broker {
    /// Broker for the server process: binds a loopback port and publishes
    /// the rendezvous file when started.
    pub fn server(config: Config, dispatcher: Arc<dyn Dispatcher>) -> Broker {
        Self::with_mode(WorkerRole::Server, config, dispatcher)
    }

    /// Broker for the client process: connects on [`Broker::request_connect`].
    pub fn client(config: Config, dispatcher: Arc<dyn Dispatcher>) -> Broker {
        Self::with_mode(WorkerRole::Client, config, dispatcher)
    }

    fn with_mode(mode: WorkerRole, config: Config, dispatcher: Arc<dyn Dispatcher>) -> Broker {
        Broker {
            shared: Arc::new(BrokerShared {
                mode,
                config,
                dispatcher,
                core: Mutex::new(BrokerCore {
                    phase: Phase::Idle,
                    channels: HashMap::new(),
                }),
                listener: Mutex::new(None),
                events: Mutex::new(VecDeque::new()),
                firing: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_listener(&self, listener: Box<dyn BrokerListener>) {
        *self.shared.listener.lock().expect("broker listener poisoned") = Some(listener);
    }

    /// Start the worker thread. Starting an already-running broker is a
    /// no-op; a stopped broker can be started again.
    pub fn start(&self) -> Result<(), ServiceError> {
        let mut core = self.shared.core.lock().expect("broker state poisoned");
        if let Phase::Running { .. } = core.phase {
            return Ok(());
        }
        self.shared.stopping.store(false, Ordering::Release);
        let observer: Arc<dyn WorkerObserver> = Arc::new(ObserverBridge {
            shared: Arc::clone(&self.shared),
        });
        let (link, join) = worker::spawn(self.shared.mode, self.shared.config.clone(), observer)
            .map_err(|e| ServiceError::generic(format!("failed to start worker: {e}")))?;
        core.phase = Phase::Running { link, join };
        Ok(())
    }

    /// Request cooperative shutdown. Synthesizes an interrupted closure on
    /// every open channel and returns true iff the worker has already
    /// exited; callers wait for the closed event and invoke again.
    pub fn try_stop(&self) -> bool {
        self.shared.stopping.store(true, Ordering::Release);
        let (link, finished) = {
            let core = self.shared.core.lock().expect("broker state poisoned");
            match &core.phase {
                Phase::Running { link, .. } => (Some(Arc::clone(link)), link.is_finished()),
                Phase::Idle | Phase::Finished => (None, true),
            }
        };
        if let Some(link) = &link {
            link.request_cancel();
        }
        let channels: Vec<_> = {
            let mut core = self.shared.core.lock().expect("broker state poisoned");
            core.channels.drain().map(|(_, ch)| ch).collect()
        };
        for ch in channels {
            ChannelShared::close_with(&ch, Some(ServiceError::interrupted()));
        }
        finished
    }

    /// Ask the client worker to attempt a connection on its next turn.
    /// Reconnection after a closed channel is driven by calling this again.
    pub fn request_connect(&self) {
        if self.shared.mode != WorkerRole::Client {
            tracing::warn!("request_connect on a server broker ignored");
            return;
        }
        let link = {
            let core = self.shared.core.lock().expect("broker state poisoned");
            match &core.phase {
                Phase::Running { link, .. } => Some(Arc::clone(link)),
                _ => None,
            }
        };
        if let Some(link) = link {
            link.post(Box::new(|state: &mut WorkerState| state.request_connect()));
        }
    }
}

/// Marshals worker effects onto the owner thread.
struct ObserverBridge {
    shared: Arc<BrokerShared>,
}

impl WorkerObserver for ObserverBridge {
    fn channel_opened(&self, channel: u64) {
        let shared = Arc::clone(&self.shared);
        self.shared
            .dispatcher
            .submit(Box::new(move || {
                BrokerShared::on_channel_opened(&shared, channel);
            }));
    }

    fn channel_closed(&self, channel: u64, error: ServiceError) {
        let shared = Arc::clone(&self.shared);
        self.shared
            .dispatcher
            .submit(Box::new(move || shared.on_channel_closed(channel, error)));
    }

    fn messages_received(&self, channel: u64, batch: Vec<Msg>) {
        let shared = Arc::clone(&self.shared);
        self.shared
            .dispatcher
            .submit(Box::new(move || shared.on_messages(channel, batch)));
    }

    fn finished(&self, error: Option<ServiceError>) {
        let shared = Arc::clone(&self.shared);
        self.shared
            .dispatcher
            .submit(Box::new(move || shared.on_finished(error)));
    }
}

impl BrokerShared {
    fn on_channel_opened(this: &Arc<Self>, id: u64) {
        if this.stopping.load(Ordering::Acquire) {
            return;
        }
        let link = {
            let core = this.core.lock().expect("broker state poisoned");
            match &core.phase {
                Phase::Running { link, .. } => Arc::clone(link),
                _ => return,
            }
        };
        let chan = ChannelShared::new(id, link, Arc::downgrade(this));
        this.core
            .lock()
            .expect("broker state poisoned")
            .channels
            .insert(id, Arc::clone(&chan));
        this.fire(BrokerEvent::ChannelOpen(Channel::from_shared(chan)));
    }

    fn on_channel_closed(&self, id: u64, error: ServiceError) {
        let chan = {
            let mut core = self.core.lock().expect("broker state poisoned");
            core.channels.remove(&id)
        };
        if let Some(chan) = chan {
            ChannelShared::close_with(&chan, Some(error));
        }
    }

    fn on_messages(&self, id: u64, batch: Vec<Msg>) {
        let chan = {
            let core = self.core.lock().expect("broker state poisoned");
            core.channels.get(&id).cloned()
        };
        if let Some(chan) = chan {
            for msg in batch {
                ChannelShared::dispatch(&chan, msg);
            }
        }
    }

    fn on_finished(&self, error: Option<ServiceError>) {
        let join = {
            let mut core = self.core.lock().expect("broker state poisoned");
            match std::mem::replace(&mut core.phase, Phase::Finished) {
                Phase::Running { join, .. } => Some(join),
                _ => None,
            }
        };
        if let Some(join) = join {
            let _ = join.join();
        }
        let channels: Vec<_> = {
            let mut core = self.core.lock().expect("broker state poisoned");
            core.channels.drain().map(|(_, ch)| ch).collect()
        };
        let close_error = error.clone().unwrap_or_else(ServiceError::interrupted);
        for ch in channels {
            ChannelShared::close_with(&ch, Some(close_error.clone()));
        }
        self.fire(BrokerEvent::Closed(error));
    }

    pub(crate) fn unlink_channel(&self, id: u64) {
        let mut core = self.core.lock().expect("broker state poisoned");
        core.channels.remove(&id);
    }

    /// Queue an event and drain non-reentrantly, so a listener closing the
    /// channel it was fired for still sees a clean event order.
    fn fire(&self, event: BrokerEvent) {
        self.events
            .lock()
            .expect("broker events poisoned")
            .push_back(event);
        if self.firing.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let next = self
                .events
                .lock()
                .expect("broker events poisoned")
                .pop_front();
            let Some(event) = next else { break };
            let taken = self.listener.lock().expect("broker listener poisoned").take();
            let Some(mut listener) = taken else { continue };
            match event {
                BrokerEvent::ChannelOpen(channel) => listener.channel_open(channel),
                BrokerEvent::Closed(error) => listener.closed(error),
            }
            let mut slot = self.listener.lock().expect("broker listener poisoned");
            if slot.is_none() {
                *slot = Some(listener);
            }
        }
        self.firing.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::QueueDispatcher;

    #[test]
    fn try_stop_before_start_reports_exited() {
        let broker = Broker::client(Config::default(), Arc::new(QueueDispatcher::new()));
        assert!(broker.try_stop());
    }

    #[test]
    fn start_is_idempotent() {
        let dispatcher = Arc::new(QueueDispatcher::new());
        let dir = tempfile::TempDir::new().unwrap();
        let config = Config {
            rendezvous_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        let broker = Broker::client(config, dispatcher.clone());
        broker.start().unwrap();
        broker.start().unwrap();

        while !broker.try_stop() {
            dispatcher.run_next(std::time::Duration::from_millis(50));
        }
    }
}
