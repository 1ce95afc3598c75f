//! Thread-side channel state machine.
//!
//! States progress strictly forward: Initial → Connecting → Handshake →
//! Open → Closed. The client side reads the rendezvous file, connects
//! non-blocking and writes the shared secret; the server side reads the
//! secret under a deadline and compares it in constant time.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, SockaddrIn, connect, socket};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::proto::Msg;
use crate::rendezvous::{self, RendezvousError, SECRET_LEN};
use crate::transport::{LinkError, MsgTransport, Readiness, Selector};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Initial,
    Connecting,
    Handshake,
    Open,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub(crate) enum ChannelError {
    #[error("could not connect: {0}")]
    Connect(std::io::Error),
    #[error(transparent)]
    Rendezvous(#[from] RendezvousError),
    #[error("handshake timeout")]
    HandshakeTimeout,
    #[error("handshake secret mismatch")]
    SecretMismatch,
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("socket error: {0}")]
    Os(#[from] Errno),
}

enum Side {
    Client {
        rendezvous_dir: PathBuf,
        secret: [u8; SECRET_LEN],
        sent: usize,
    },
    Server {
        secret: [u8; SECRET_LEN],
        buf: [u8; SECRET_LEN],
        filled: usize,
        deadline: Instant,
    },
}

pub(crate) struct ThreadChannel {
    id: u64,
    state: ChannelState,
    side: Side,
    stream: Option<TcpStream>,
    transport: MsgTransport,
    send_queue: VecDeque<Msg>,
}

impl ThreadChannel {
    /// A client channel; the connect attempt starts on its first turn and
    /// re-reads the rendezvous file every time.
    pub(crate) fn client(id: u64, rendezvous_dir: PathBuf) -> Self {
        ThreadChannel {
            id,
            state: ChannelState::Initial,
            side: Side::Client {
                rendezvous_dir,
                secret: [0; SECRET_LEN],
                sent: 0,
            },
            stream: None,
            transport: MsgTransport::new(),
            send_queue: VecDeque::new(),
        }
    }

    /// A server channel for a freshly accepted socket, already in Handshake.
    pub(crate) fn server(
        id: u64,
        stream: TcpStream,
        secret: [u8; SECRET_LEN],
        deadline: Instant,
    ) -> Self {
        ThreadChannel {
            id,
            state: ChannelState::Handshake,
            side: Side::Server {
                secret,
                buf: [0; SECRET_LEN],
                filled: 0,
                deadline,
            },
            stream: Some(stream),
            transport: MsgTransport::new(),
            send_queue: VecDeque::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub(crate) fn queue_msg(&mut self, msg: Msg) {
        self.send_queue.push_back(msg);
    }

    /// Register interests for this turn, running state-specific work first.
    pub(crate) fn before_select<'a>(
        &'a mut self,
        sel: &mut Selector<'a>,
        now: Instant,
    ) -> Result<(), ChannelError> {
        match self.state {
            ChannelState::Initial => {
                self.start_connect()?;
                if let Some(stream) = &self.stream {
                    sel.add_write(stream.as_fd());
                }
                sel.lower_timeout(Duration::ZERO);
            }
            ChannelState::Connecting => {
                if let Some(stream) = &self.stream {
                    sel.add_write(stream.as_fd());
                }
                // Revisit promptly while the connect is in flight.
                sel.lower_timeout(Duration::ZERO);
            }
            ChannelState::Handshake => match &self.side {
                Side::Client { .. } => {
                    if let Some(stream) = &self.stream {
                        sel.add_write(stream.as_fd());
                    }
                }
                Side::Server { deadline, .. } => {
                    let remaining = deadline.saturating_duration_since(now);
                    if let Some(stream) = &self.stream {
                        sel.add_read(stream.as_fd());
                    }
                    sel.lower_timeout(remaining);
                }
            },
            ChannelState::Open => {
                if self.transport.ready_to_send()
                    && let Some(msg) = self.send_queue.pop_front()
                {
                    self.transport.send_msg(&msg)?;
                }
                self.transport.begin_recv();
                if let Some(stream) = &self.stream {
                    self.transport.update_selector(stream.as_fd(), sel);
                }
            }
        }
        Ok(())
    }

    /// React to readiness; returns messages received this turn.
    pub(crate) fn after_select(
        &mut self,
        ready: &Readiness,
        now: Instant,
    ) -> Result<Vec<Msg>, ChannelError> {
        match self.state {
            ChannelState::Initial => Ok(Vec::new()),
            ChannelState::Connecting => {
                self.check_connect(ready)?;
                if self.state == ChannelState::Handshake {
                    self.advance_handshake(ready, now)?;
                }
                Ok(Vec::new())
            }
            ChannelState::Handshake => {
                self.advance_handshake(ready, now)?;
                Ok(Vec::new())
            }
            ChannelState::Open => self.run_transport(ready),
        }
    }

    fn start_connect(&mut self) -> Result<(), ChannelError> {
        let (dir, secret_slot) = match &mut self.side {
            Side::Client {
                rendezvous_dir,
                secret,
                ..
            } => (rendezvous_dir.clone(), secret),
            // Server channels are born in Handshake; nothing to do here.
            Side::Server { .. } => return Ok(()),
        };
        let info = rendezvous::read_info(&dir)?;
        *secret_slot = info.secret;

        let fd = socket(
            AddressFamily::Inet,
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = SockaddrIn::new(127, 0, 0, 1, info.port);
        match connect(fd.as_raw_fd(), &addr) {
            Ok(()) => {}
            Err(Errno::EINPROGRESS) => {}
            Err(errno) => return Err(ChannelError::Connect(std::io::Error::from(errno))),
        }
        let stream = TcpStream::from(fd);
        let _ = stream.set_nodelay(true);
        self.stream = Some(stream);
        self.state = ChannelState::Connecting;
        tracing::debug!(channel = self.id, port = info.port, "connect started");
        Ok(())
    }

    fn check_connect(&mut self, ready: &Readiness) -> Result<(), ChannelError> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        if !ready.writable(stream) {
            return Ok(());
        }
        if let Some(err) = stream.take_error()? {
            return Err(ChannelError::Connect(err));
        }
        self.state = ChannelState::Handshake;
        tracing::debug!(channel = self.id, "connected, starting handshake");
        Ok(())
    }

    fn advance_handshake(&mut self, ready: &Readiness, now: Instant) -> Result<(), ChannelError> {
        match &mut self.side {
            Side::Client { secret, sent, .. } => {
                let Some(stream) = &self.stream else {
                    return Ok(());
                };
                if !ready.writable(stream) {
                    return Ok(());
                }
                let mut stream = stream;
                while *sent < SECRET_LEN {
                    match stream.write(&secret[*sent..]) {
                        Ok(0) => return Err(LinkError::ConnectionLost.into()),
                        Ok(n) => *sent += n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                self.state = ChannelState::Open;
                self.transport.begin_recv();
                tracing::debug!(channel = self.id, "handshake sent, channel open");
                Ok(())
            }
            Side::Server {
                secret,
                buf,
                filled,
                deadline,
            } => {
                if now >= *deadline {
                    return Err(ChannelError::HandshakeTimeout);
                }
                let Some(stream) = &self.stream else {
                    return Ok(());
                };
                if !ready.readable(stream) {
                    return Ok(());
                }
                let mut stream = stream;
                while *filled < SECRET_LEN {
                    match stream.read(&mut buf[*filled..]) {
                        Ok(0) => return Err(LinkError::ConnectionLost.into()),
                        Ok(n) => *filled += n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                if !bool::from(buf[..].ct_eq(&secret[..])) {
                    return Err(ChannelError::SecretMismatch);
                }
                self.state = ChannelState::Open;
                self.transport.begin_recv();
                tracing::debug!(channel = self.id, "handshake verified, channel open");
                Ok(())
            }
        }
    }

    fn run_transport(&mut self, ready: &Readiness) -> Result<Vec<Msg>, ChannelError> {
        let Some(stream) = &self.stream else {
            return Ok(Vec::new());
        };
        let mut batch = Vec::new();
        loop {
            self.transport.transfer(stream, ready)?;
            match self.transport.take_received() {
                Some(msg) => {
                    batch.push(msg);
                    self.transport.begin_recv();
                }
                None => break,
            }
        }
        Ok(batch)
    }
}
