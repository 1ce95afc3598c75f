//! Broker-side channel: role dispatch and query correlation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::ServiceError;
use crate::proto::{Msg, NS_CANCEL_CMD};
use crate::worker::{WorkerLink, WorkerState};

use super::BrokerShared;
use super::query::{IncomingQuery, IncomingShared, OutgoingQuery, OutgoingShared};

/// Channel events, fired on the owner thread.
pub trait ChannelListener: Send {
    /// The peer sent a command expecting a reply.
    fn incoming_query(&mut self, query: IncomingQuery);
    /// The peer sent an asynchronous event.
    fn incoming_event(&mut self, msg: Msg);
    /// The channel closed. `None` means the owner closed it.
    fn closed(&mut self, error: Option<ServiceError>);
}

struct ChannelCore {
    open: bool,
    close_error: Option<ServiceError>,
    next_cmd_id: u64,
    outgoing: HashMap<u64, Arc<OutgoingShared>>,
    incoming: HashMap<u64, Arc<IncomingShared>>,
}

enum ChannelEvent {
    Query(IncomingQuery),
    Event(Msg),
    Closed(Option<ServiceError>),
}

pub(crate) struct ChannelShared {
    id: u64,
    link: Arc<WorkerLink>,
    broker: Weak<BrokerShared>,
    core: Mutex<ChannelCore>,
    listener: Mutex<Option<Box<dyn ChannelListener>>>,
    events: Mutex<VecDeque<ChannelEvent>>,
    firing: AtomicBool,
}

impl ChannelShared {
    pub(crate) fn new(id: u64, link: Arc<WorkerLink>, broker: Weak<BrokerShared>) -> Arc<Self> {
        Arc::new(ChannelShared {
            id,
            link,
            broker,
            core: Mutex::new(ChannelCore {
                open: true,
                close_error: None,
                next_cmd_id: 1,
                outgoing: HashMap::new(),
                incoming: HashMap::new(),
            }),
            listener: Mutex::new(None),
            events: Mutex::new(VecDeque::new()),
            firing: AtomicBool::new(false),
        })
    }

    /// Dispatch one received message by its role bits.
    pub(crate) fn dispatch(this: &Arc<Self>, msg: Msg) {
        let ty = msg.ty;
        if ty.is_cmd() {
            if ty.namespace() == NS_CANCEL_CMD {
                let query = {
                    let mut core = this.core.lock().expect("channel state poisoned");
                    core.incoming.remove(&msg.id)
                };
                if let Some(query) = query {
                    IncomingShared::fire_cancelled(&query);
                }
            } else {
                let shared = IncomingShared::new(Arc::downgrade(this), msg);
                {
                    let mut core = this.core.lock().expect("channel state poisoned");
                    // A well-behaved peer never reuses a live id; replacement
                    // drops any stale entry.
                    core.incoming.insert(shared.cmd_id(), Arc::clone(&shared));
                }
                this.fire(ChannelEvent::Query(IncomingQuery::from_shared(shared)));
            }
        } else if ty.is_res() {
            let query = {
                let mut core = this.core.lock().expect("channel state poisoned");
                core.outgoing.remove(&msg.id)
            };
            match query {
                Some(query) => OutgoingShared::complete_with_reply(&query, msg),
                // Unknown ids are dropped silently (late reply after cancel).
                None => tracing::debug!(channel = this.id, id = msg.id, "unmatched response dropped"),
            }
        } else if ty.is_evt() {
            this.fire(ChannelEvent::Event(msg));
        } else {
            tracing::warn!(
                channel = this.id,
                raw = ty.raw(),
                "message with unknown role dropped"
            );
        }
    }

    /// One-way open → closed transition. Completes every pending outgoing
    /// query, cancels every pending incoming query, then fires the closed
    /// event. `None` means the owner closed the channel.
    pub(crate) fn close_with(this: &Arc<Self>, error: Option<ServiceError>) {
        let (outgoing, incoming) = {
            let mut core = this.core.lock().expect("channel state poisoned");
            if !core.open {
                return;
            }
            core.open = false;
            core.close_error = error.clone();
            (
                core.outgoing.drain().map(|(_, q)| q).collect::<Vec<_>>(),
                core.incoming.drain().map(|(_, q)| q).collect::<Vec<_>>(),
            )
        };

        // Drop the thread-side channel too; harmless if the worker already
        // lost it.
        let id = this.id;
        this.link
            .post(Box::new(move |state: &mut WorkerState| state.close_channel(id)));
        if let Some(broker) = this.broker.upgrade() {
            broker.unlink_channel(this.id);
        }

        let query_error = error
            .clone()
            .unwrap_or_else(|| ServiceError::cancelled("channel closed"));
        for query in outgoing {
            OutgoingShared::complete_with_error(&query, query_error.clone());
        }
        for query in incoming {
            IncomingShared::fire_cancelled(&query);
        }
        this.fire(ChannelEvent::Closed(error));
    }

    pub(crate) fn send_command(this: &Arc<Self>, mut msg: Msg) -> Result<OutgoingQuery, ServiceError> {
        let query = {
            let mut core = this.core.lock().expect("channel state poisoned");
            if !core.open {
                return Err(closed_error(&core));
            }
            let id = core.next_cmd_id;
            core.next_cmd_id += 1;
            msg.id = id;
            let query = OutgoingShared::new(Arc::downgrade(this), msg.clone());
            core.outgoing.insert(id, Arc::clone(&query));
            query
        };
        this.post_send(msg);
        Ok(OutgoingQuery::from_shared(query))
    }

    pub(crate) fn send_event(&self, msg: Msg) -> Result<(), ServiceError> {
        {
            let core = self.core.lock().expect("channel state poisoned");
            if !core.open {
                return Err(closed_error(&core));
            }
        }
        self.post_send(msg);
        Ok(())
    }

    pub(crate) fn post_send(&self, msg: Msg) {
        let id = self.id;
        self.link
            .post(Box::new(move |state: &mut WorkerState| {
                state.queue_message(id, msg);
            }));
    }

    pub(crate) fn remove_outgoing(&self, id: u64) {
        let mut core = self.core.lock().expect("channel state poisoned");
        core.outgoing.remove(&id);
    }

    pub(crate) fn remove_incoming(&self, id: u64) {
        let mut core = self.core.lock().expect("channel state poisoned");
        core.incoming.remove(&id);
    }

    fn is_open(&self) -> bool {
        self.core.lock().expect("channel state poisoned").open
    }

    fn close_error(&self) -> Option<ServiceError> {
        self.core
            .lock()
            .expect("channel state poisoned")
            .close_error
            .clone()
    }

    /// Queue an event and drain non-reentrantly; see the broker's fire.
    fn fire(&self, event: ChannelEvent) {
        self.events
            .lock()
            .expect("channel events poisoned")
            .push_back(event);
        if self.firing.swap(true, Ordering::AcqRel) {
            return;
        }
        loop {
            let next = self
                .events
                .lock()
                .expect("channel events poisoned")
                .pop_front();
            let Some(event) = next else { break };
            let taken = self
                .listener
                .lock()
                .expect("channel listener poisoned")
                .take();
            let Some(mut listener) = taken else { continue };
            match event {
                ChannelEvent::Query(query) => listener.incoming_query(query),
                ChannelEvent::Event(msg) => listener.incoming_event(msg),
                ChannelEvent::Closed(error) => listener.closed(error),
            }
            let mut slot = self.listener.lock().expect("channel listener poisoned");
            if slot.is_none() {
                *slot = Some(listener);
            }
        }
        self.firing.store(false, Ordering::Release);
    }
}

fn closed_error(core: &ChannelCore) -> ServiceError {
    core.close_error
        .clone()
        .unwrap_or_else(|| ServiceError::conn_lost("channel closed"))
}

/// Handle to a logical channel. Clones share the same channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    pub(crate) fn from_shared(shared: Arc<ChannelShared>) -> Self {
        Channel { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn is_open(&self) -> bool {
        self.shared.is_open()
    }

    /// The error the channel closed with, if any.
    pub fn close_error(&self) -> Option<ServiceError> {
        self.shared.close_error()
    }

    pub fn set_listener(&self, listener: Box<dyn ChannelListener>) {
        *self
            .shared
            .listener
            .lock()
            .expect("channel listener poisoned") = Some(listener);
    }

    /// Send a command and return its query handle immediately. The next
    /// monotonic command id is assigned and stamped into the message.
    pub fn send_command(&self, msg: Msg) -> Result<OutgoingQuery, ServiceError> {
        ChannelShared::send_command(&self.shared, msg)
    }

    /// Send an asynchronous event. The message id is forwarded unchanged;
    /// id 0 marks a transient event.
    pub fn send_event(&self, msg: Msg) -> Result<(), ServiceError> {
        self.shared.send_event(msg)
    }

    /// Close the channel normally. Pending outgoing queries complete with a
    /// cancelled error; pending incoming queries fire cancellation.
    pub fn close(&self) {
        ChannelShared::close_with(&self.shared, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceErrorKind;
    use crate::proto::MsgType;
    use crate::worker::test_link;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        events: Arc<StdMutex<Vec<String>>>,
        queries: Arc<StdMutex<Vec<IncomingQuery>>>,
    }

    impl ChannelListener for Recorder {
        fn incoming_query(&mut self, query: IncomingQuery) {
            self.events.lock().unwrap().push(format!("query:{}", query.id()));
            self.queries.lock().unwrap().push(query);
        }
        fn incoming_event(&mut self, msg: Msg) {
            self.events.lock().unwrap().push(format!("event:{}", msg.id));
        }
        fn closed(&mut self, error: Option<ServiceError>) {
            let kind = error.map(|e| format!("{:?}", e.kind));
            self.events
                .lock()
                .unwrap()
                .push(format!("closed:{}", kind.unwrap_or_else(|| "none".into())));
        }
    }

    fn channel_with_recorder() -> (Arc<ChannelShared>, Channel, Recorder) {
        let shared = ChannelShared::new(7, test_link(), Weak::new());
        let channel = Channel::from_shared(Arc::clone(&shared));
        let recorder = Recorder::default();
        channel.set_listener(Box::new(Recorder {
            events: Arc::clone(&recorder.events),
            queries: Arc::clone(&recorder.queries),
        }));
        (shared, channel, recorder)
    }

    #[test]
    fn command_ids_are_monotonic_from_one() {
        let (_shared, channel, _rec) = channel_with_recorder();
        let q1 = channel.send_command(Msg::new(MsgType::command(100))).unwrap();
        let q2 = channel.send_command(Msg::new(MsgType::command(100))).unwrap();
        assert_eq!(q1.id(), 1);
        assert_eq!(q2.id(), 2);
        assert_eq!(q1.command().id, 1);
    }

    #[test]
    fn response_completes_matching_query_once() {
        let (shared, channel, _rec) = channel_with_recorder();
        let query = channel.send_command(Msg::new(MsgType::command(100))).unwrap();
        let fired = Arc::new(StdMutex::new(0));
        let fired_in = Arc::clone(&fired);
        query.on_completion(move |q| {
            assert!(q.reply().is_some());
            *fired_in.lock().unwrap() += 1;
        });

        let mut reply = Msg::new(MsgType::response(100));
        reply.id = query.id();
        ChannelShared::dispatch(&shared, reply.clone());
        ChannelShared::dispatch(&shared, reply);
        assert_eq!(*fired.lock().unwrap(), 1);
        assert!(!query.is_pending());
    }

    #[test]
    fn unknown_response_ids_are_dropped() {
        let (shared, _channel, rec) = channel_with_recorder();
        let mut reply = Msg::new(MsgType::response(100));
        reply.id = 99;
        ChannelShared::dispatch(&shared, reply);
        assert!(rec.events.lock().unwrap().is_empty());
    }

    #[test]
    fn incoming_command_raises_query_and_cancel_cmd_cancels_it() {
        let (shared, _channel, rec) = channel_with_recorder();
        let mut cmd = Msg::new(MsgType::command(100)).with_str("work");
        cmd.id = 5;
        ChannelShared::dispatch(&shared, cmd);
        assert_eq!(rec.events.lock().unwrap().as_slice(), &["query:5".to_string()]);

        let cancelled = Arc::new(StdMutex::new(false));
        {
            let queries = rec.queries.lock().unwrap();
            let flag = Arc::clone(&cancelled);
            queries[0].on_cancellation(move |_| *flag.lock().unwrap() = true);
        }

        let mut cancel = Msg::new(MsgType::command(NS_CANCEL_CMD));
        cancel.id = 5;
        ChannelShared::dispatch(&shared, cancel);
        assert!(*cancelled.lock().unwrap());
    }

    #[test]
    fn events_fire_in_arrival_order() {
        let (shared, _channel, rec) = channel_with_recorder();
        let mut ev = Msg::new(MsgType::event(3));
        ev.id = 0;
        ChannelShared::dispatch(&shared, ev.clone());
        ev.id = 1;
        ChannelShared::dispatch(&shared, ev);
        assert_eq!(
            rec.events.lock().unwrap().as_slice(),
            &["event:0".to_string(), "event:1".to_string()]
        );
    }

    #[test]
    fn close_completes_outgoing_and_cancels_incoming() {
        let (shared, channel, rec) = channel_with_recorder();
        let query = channel.send_command(Msg::new(MsgType::command(100))).unwrap();

        let mut cmd = Msg::new(MsgType::command(100));
        cmd.id = 9;
        ChannelShared::dispatch(&shared, cmd);
        let cancelled = Arc::new(StdMutex::new(false));
        {
            let queries = rec.queries.lock().unwrap();
            let flag = Arc::clone(&cancelled);
            queries[0].on_cancellation(move |_| *flag.lock().unwrap() = true);
        }

        channel.close();
        assert!(!channel.is_open());
        assert_eq!(
            query.error().map(|e| e.kind),
            Some(ServiceErrorKind::Cancelled)
        );
        assert!(*cancelled.lock().unwrap());
        assert_eq!(
            rec.events.lock().unwrap().last().map(String::as_str),
            Some("closed:none")
        );

        // Closed is terminal and idempotent.
        channel.close();
        assert!(channel.send_command(Msg::new(MsgType::command(1))).is_err());
        assert!(channel.send_event(Msg::new(MsgType::event(1))).is_err());
    }

    #[test]
    fn close_inside_handler_produces_clean_close_event() {
        struct CloseOnQuery {
            channel: StdMutex<Option<Channel>>,
            events: Arc<StdMutex<Vec<String>>>,
        }
        impl ChannelListener for CloseOnQuery {
            fn incoming_query(&mut self, _query: IncomingQuery) {
                self.events.lock().unwrap().push("query".into());
                if let Some(channel) = self.channel.lock().unwrap().take() {
                    channel.close();
                }
            }
            fn incoming_event(&mut self, _msg: Msg) {
                self.events.lock().unwrap().push("event".into());
            }
            fn closed(&mut self, error: Option<ServiceError>) {
                assert!(error.is_none());
                self.events.lock().unwrap().push("closed".into());
            }
        }

        let shared = ChannelShared::new(1, test_link(), Weak::new());
        let channel = Channel::from_shared(Arc::clone(&shared));
        let events = Arc::new(StdMutex::new(Vec::new()));
        channel.set_listener(Box::new(CloseOnQuery {
            channel: StdMutex::new(Some(channel.clone())),
            events: Arc::clone(&events),
        }));

        let mut cmd = Msg::new(MsgType::command(42));
        cmd.id = 1;
        ChannelShared::dispatch(&shared, cmd);
        assert_eq!(
            events.lock().unwrap().as_slice(),
            &["query".to_string(), "closed".to_string()]
        );
        assert!(!channel.is_open());
    }
}
