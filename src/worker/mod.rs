//! Worker thread: owns all sockets and runs the select/dispatch loop.
//!
//! One turn: build a selector, register the wake-up socket and every
//! channel's interests, wait, drain the wake-up socket, honor cancellation,
//! drain the broker mailbox, let channels react, then accept at most one
//! pending connection (server role). Channel failures close that channel
//! only; selector failures end the worker.

pub(crate) mod thread_channel;

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender, unbounded};
use nix::sys::socket::{
    AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, bind, listen, socket,
};
use thiserror::Error;

use crate::config::Config;
use crate::error::ServiceError;
use crate::proto::Msg;
use crate::rendezvous::{self, RendezvousGuard, RendezvousInfo, SECRET_LEN};
use crate::transport::{Readiness, Selector, SelectorError};

use self::thread_channel::{ChannelError, ThreadChannel};

#[derive(Debug, Error)]
#[non_exhaustive]
pub(crate) enum WorkerError {
    #[error("interrupted")]
    Interrupted,
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Rendezvous(#[from] rendezvous::RendezvousError),
    #[error("socket error: {0}")]
    Os(#[from] nix::errno::Errno),
}

/// Worker-side effects the broker observes. Implementations marshal every
/// call onto the owner thread through the dispatcher.
pub(crate) trait WorkerObserver: Send + Sync {
    fn channel_opened(&self, channel: u64);
    fn channel_closed(&self, channel: u64, error: ServiceError);
    fn messages_received(&self, channel: u64, batch: Vec<Msg>);
    fn finished(&self, error: Option<ServiceError>);
}

pub(crate) type WorkerTask = Box<dyn FnOnce(&mut WorkerState) + Send>;

/// Owner-side handle: posts mailbox tasks and cooperative cancellation.
pub(crate) struct WorkerLink {
    tx: Sender<WorkerTask>,
    wake_tx: UnixStream,
    cancel: AtomicBool,
    finished: AtomicBool,
}

impl WorkerLink {
    pub(crate) fn post(&self, task: WorkerTask) {
        if self.tx.send(task).is_ok() {
            self.wake();
        }
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
        self.wake();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    fn wake(&self) {
        // One byte per notification; the worker drains in bulk. A full pipe
        // means the worker is already due to wake, so the error is ignored.
        let _ = (&self.wake_tx).write(&[1u8]);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerRole {
    Server,
    Client,
}

enum RoleState {
    Server {
        listener: TcpListener,
        secret: [u8; SECRET_LEN],
        _guard: RendezvousGuard,
    },
    Client {
        connect_requested: bool,
    },
}

/// State reachable from mailbox tasks.
pub(crate) struct WorkerState {
    config: Config,
    role: RoleState,
    channels: HashMap<u64, ThreadChannel>,
    next_channel_id: u64,
}

impl WorkerState {
    pub(crate) fn queue_message(&mut self, channel: u64, msg: Msg) {
        // A channel that raced its own close simply drops the message.
        if let Some(ch) = self.channels.get_mut(&channel) {
            ch.queue_msg(msg);
        }
    }

    pub(crate) fn close_channel(&mut self, channel: u64) {
        if self.channels.remove(&channel).is_some() {
            tracing::debug!(channel, "channel closed by broker");
        }
    }

    pub(crate) fn request_connect(&mut self) {
        if let RoleState::Client { connect_requested } = &mut self.role {
            *connect_requested = true;
        }
    }
}

/// Spawn the worker thread. Role-specific startup (bind, rendezvous publish)
/// runs inside the thread; startup failures surface through
/// [`WorkerObserver::finished`].
pub(crate) fn spawn(
    role: WorkerRole,
    config: Config,
    observer: Arc<dyn WorkerObserver>,
) -> std::io::Result<(Arc<WorkerLink>, JoinHandle<()>)> {
    let (tx, rx) = unbounded();
    let (wake_tx, wake_rx) = UnixStream::pair()?;
    wake_tx.set_nonblocking(true)?;
    wake_rx.set_nonblocking(true)?;
    let link = Arc::new(WorkerLink {
        tx,
        wake_tx,
        cancel: AtomicBool::new(false),
        finished: AtomicBool::new(false),
    });
    let thread_link = Arc::clone(&link);
    let handle = std::thread::Builder::new()
        .name("anp-worker".to_string())
        .spawn(move || run(role, config, thread_link, observer, rx, wake_rx))?;
    Ok((link, handle))
}

fn run(
    role: WorkerRole,
    config: Config,
    link: Arc<WorkerLink>,
    observer: Arc<dyn WorkerObserver>,
    mailbox_rx: Receiver<WorkerTask>,
    wake_rx: UnixStream,
) {
    let role_state = match startup(role, &config) {
        Ok(state) => state,
        Err(err) => {
            tracing::error!("worker startup failed: {err}");
            link.mark_finished();
            observer.finished(Some(ServiceError::generic(format!(
                "worker startup failed: {err}"
            ))));
            return;
        }
    };

    let mut worker = Worker {
        state: WorkerState {
            config,
            role: role_state,
            channels: HashMap::new(),
            next_channel_id: 1,
        },
        mailbox_rx,
        wake_rx,
        link: Arc::clone(&link),
        observer: Arc::clone(&observer),
    };

    let error = worker.run_loop();
    let service_error = match &error {
        WorkerError::Interrupted => {
            tracing::debug!("worker interrupted");
            None
        }
        other => {
            tracing::error!("worker loop failed: {other}");
            Some(ServiceError::generic(format!("worker failed: {other}")))
        }
    };

    // Dropping the worker closes every channel socket, the listener, and
    // removes the rendezvous files through the guard.
    drop(worker);

    link.mark_finished();
    observer.finished(service_error);
}

fn startup(role: WorkerRole, config: &Config) -> Result<RoleState, WorkerError> {
    match role {
        WorkerRole::Client => Ok(RoleState::Client {
            connect_requested: false,
        }),
        WorkerRole::Server => {
            let fd = socket(
                AddressFamily::Inet,
                SockType::Stream,
                SockFlag::SOCK_CLOEXEC,
                None,
            )?;
            bind(fd.as_raw_fd(), &SockaddrIn::new(127, 0, 0, 1, 0))?;
            listen(&fd, Backlog::new(1)?)?;
            let listener = TcpListener::from(fd);
            listener.set_nonblocking(true)?;
            let port = listener.local_addr()?.port();

            let secret = rendezvous::generate_secret()?;
            let dir = config.rendezvous_dir();
            let guard = rendezvous::publish(&dir, &RendezvousInfo { port, secret })?;
            tracing::info!(port, dir = %dir.display(), "server worker listening");
            Ok(RoleState::Server {
                listener,
                secret,
                _guard: guard,
            })
        }
    }
}

struct Worker {
    state: WorkerState,
    mailbox_rx: Receiver<WorkerTask>,
    wake_rx: UnixStream,
    link: Arc<WorkerLink>,
    observer: Arc<dyn WorkerObserver>,
}

enum Notice {
    Opened(u64),
    Received(u64, Vec<Msg>),
}

impl Worker {
    fn run_loop(&mut self) -> WorkerError {
        loop {
            if let Err(err) = self.turn() {
                return err;
            }
        }
    }

    fn turn(&mut self) -> Result<(), WorkerError> {
        self.maybe_start_connect();

        let mut failed: Vec<(u64, ChannelError)> = Vec::new();

        let mut sel = Selector::new();
        sel.add_read(self.wake_rx.as_fd());
        let now = Instant::now();
        for (&id, ch) in self.state.channels.iter_mut() {
            if let Err(err) = ch.before_select(&mut sel, now) {
                failed.push((id, err));
            }
        }
        if let RoleState::Server { listener, .. } = &self.state.role {
            sel.add_read(listener.as_fd());
        }

        let ready = sel.wait()?;

        self.drain_wake();
        if self.link.is_cancelled() {
            return Err(WorkerError::Interrupted);
        }

        while let Ok(task) = self.mailbox_rx.try_recv() {
            task(&mut self.state);
        }

        let mut notices = Vec::new();
        let now = Instant::now();
        for (&id, ch) in self.state.channels.iter_mut() {
            if failed.iter().any(|(failed_id, _)| *failed_id == id) {
                continue;
            }
            let was_open = ch.is_open();
            match ch.after_select(&ready, now) {
                Ok(batch) => {
                    if !was_open && ch.is_open() {
                        notices.push(Notice::Opened(id));
                    }
                    if !batch.is_empty() {
                        notices.push(Notice::Received(id, batch));
                    }
                }
                Err(err) => failed.push((id, err)),
            }
        }

        for (id, err) in failed {
            let was_open = self
                .state
                .channels
                .remove(&id)
                .map(|ch| ch.is_open())
                .unwrap_or(false);
            tracing::warn!(channel = id, "channel failed: {err}");
            if was_open {
                self.observer
                    .channel_closed(id, ServiceError::conn_lost(format!("connection lost: {err}")));
            }
        }

        for notice in notices {
            match notice {
                Notice::Opened(id) => self.observer.channel_opened(id),
                Notice::Received(id, batch) => self.observer.messages_received(id, batch),
            }
        }

        self.accept_pending(&ready);
        Ok(())
    }

    fn maybe_start_connect(&mut self) {
        let RoleState::Client { connect_requested } = &mut self.state.role else {
            return;
        };
        if !*connect_requested {
            return;
        }
        *connect_requested = false;
        if !self.state.channels.is_empty() {
            tracing::warn!("connect requested while a channel exists; ignored");
            return;
        }
        let id = self.state.next_channel_id;
        self.state.next_channel_id += 1;
        let dir = self.state.config.rendezvous_dir();
        self.state.channels.insert(id, ThreadChannel::client(id, dir));
        tracing::debug!(channel = id, "client connect scheduled");
    }

    fn drain_wake(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!("wake drain failed: {e}");
                    break;
                }
            }
        }
    }

    /// Accept at most one pending connection per turn.
    fn accept_pending(&mut self, ready: &Readiness) {
        let RoleState::Server {
            listener, secret, ..
        } = &self.state.role
        else {
            return;
        };
        if !ready.readable(listener) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    tracing::warn!("accepted socket setup failed: {e}");
                    return;
                }
                let _ = stream.set_nodelay(true);
                let id = self.state.next_channel_id;
                self.state.next_channel_id += 1;
                let deadline = Instant::now() + self.state.config.handshake_timeout();
                let channel = ThreadChannel::server(id, stream, *secret, deadline);
                self.state.channels.insert(id, channel);
                tracing::debug!(channel = id, peer = %peer, "accepted connection");
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => tracing::warn!("accept failed: {e}"),
        }
    }
}

/// Link wired to nothing, for exercising broker-side objects in isolation.
#[cfg(test)]
pub(crate) fn test_link() -> Arc<WorkerLink> {
    let (tx, _rx) = unbounded();
    let (wake_tx, _wake_rx) = UnixStream::pair().expect("socket pair");
    Arc::new(WorkerLink {
        tx,
        wake_tx,
        cancel: AtomicBool::new(false),
        finished: AtomicBool::new(false),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingObserver {
        finished: Mutex<Vec<Option<ServiceError>>>,
    }

    impl WorkerObserver for RecordingObserver {
        fn channel_opened(&self, _channel: u64) {}
        fn channel_closed(&self, _channel: u64, _error: ServiceError) {}
        fn messages_received(&self, _channel: u64, _batch: Vec<Msg>) {}
        fn finished(&self, error: Option<ServiceError>) {
            self.finished.lock().unwrap().push(error);
        }
    }

    #[test]
    fn server_worker_publishes_rendezvous_and_stops_clean() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            rendezvous_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        let observer = Arc::new(RecordingObserver::default());
        let (link, handle) = spawn(WorkerRole::Server, config, observer.clone()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let info = loop {
            match rendezvous::read_info(dir.path()) {
                Ok(info) => break info,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => panic!("rendezvous never published: {e}"),
            }
        };
        assert_ne!(info.port, 0);

        link.request_cancel();
        handle.join().unwrap();
        assert!(link.is_finished());
        assert_eq!(observer.finished.lock().unwrap().as_slice(), &[None]);
        // The guard removed the info file on shutdown.
        assert!(!dir.path().join(rendezvous::INFO_FILE).exists());
    }

    #[test]
    fn client_worker_stops_on_cancel_without_connecting() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            rendezvous_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        let observer = Arc::new(RecordingObserver::default());
        let (link, handle) = spawn(WorkerRole::Client, config, observer.clone()).unwrap();
        link.request_cancel();
        handle.join().unwrap();
        assert_eq!(observer.finished.lock().unwrap().as_slice(), &[None]);
    }

    #[test]
    fn posted_tasks_reach_worker_state() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            rendezvous_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        let observer = Arc::new(RecordingObserver::default());
        let (link, handle) = spawn(WorkerRole::Client, config, observer).unwrap();

        let (ack_tx, ack_rx) = unbounded::<u64>();
        link.post(Box::new(move |state: &mut WorkerState| {
            let _ = ack_tx.send(state.next_channel_id);
        }));
        assert_eq!(
            ack_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            1,
            "mailbox task ran with worker state"
        );

        link.request_cancel();
        handle.join().unwrap();
    }
}
