//! Per-socket message transport state machine.
//!
//! Drives partial header/payload reads and partial writes over a
//! non-blocking socket. Receiving and sending are independent; at most one
//! message is in flight in each direction.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::os::fd::BorrowedFd;

use bytes::Bytes;
use thiserror::Error;

use crate::proto::{CodecError, HEADER_LEN, Header, MAX_PAYLOAD_BYTES, Msg, parse_payload};

use super::selector::{Readiness, Selector};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection lost")]
    ConnectionLost,
    #[error("payload too large: {got_bytes} exceeds {max_bytes}")]
    PayloadTooLarge { max_bytes: usize, got_bytes: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("a send is already in progress")]
    SendBusy,
}

enum RecvState {
    Idle,
    Header { buf: [u8; HEADER_LEN], filled: usize },
    Payload { header: Header, buf: Vec<u8>, filled: usize },
    Received(Msg),
}

enum SendState {
    Idle,
    Sending { frame: Bytes, written: usize },
}

pub struct MsgTransport {
    recv: RecvState,
    send: SendState,
}

impl MsgTransport {
    pub fn new() -> Self {
        MsgTransport {
            recv: RecvState::Idle,
            send: SendState::Idle,
        }
    }

    /// Start receiving the next message. No-op unless the receive side is
    /// idle, so an in-flight receive is never restarted.
    pub fn begin_recv(&mut self) {
        if let RecvState::Idle = self.recv {
            self.recv = RecvState::Header {
                buf: [0; HEADER_LEN],
                filled: 0,
            };
        }
    }

    pub fn is_receiving(&self) -> bool {
        !matches!(self.recv, RecvState::Idle)
    }

    pub fn done_receiving(&self) -> bool {
        matches!(self.recv, RecvState::Received(_))
    }

    pub fn is_sending(&self) -> bool {
        matches!(self.send, SendState::Sending { .. })
    }

    pub fn ready_to_send(&self) -> bool {
        matches!(self.send, SendState::Idle)
    }

    /// Stage a message for sending. Fails if a send is already in flight.
    pub fn send_msg(&mut self, msg: &Msg) -> Result<(), LinkError> {
        if !self.ready_to_send() {
            return Err(LinkError::SendBusy);
        }
        let frame = msg.encode(true)?;
        self.send = SendState::Sending { frame, written: 0 };
        Ok(())
    }

    /// Take the completed message, if one has been fully received.
    pub fn take_received(&mut self) -> Option<Msg> {
        if !self.done_receiving() {
            return None;
        }
        match std::mem::replace(&mut self.recv, RecvState::Idle) {
            RecvState::Received(msg) => Some(msg),
            _ => None,
        }
    }

    /// Register read interest while a receive is in progress and write
    /// interest while a send is in progress.
    pub fn update_selector<'fd>(&self, fd: BorrowedFd<'fd>, sel: &mut Selector<'fd>) {
        if self.is_receiving() && !self.done_receiving() {
            sel.add_read(fd);
        }
        if self.is_sending() {
            sel.add_write(fd);
        }
    }

    /// Advance both directions as far as the socket allows.
    pub fn transfer(&mut self, stream: &TcpStream, ready: &Readiness) -> Result<(), LinkError> {
        if ready.readable(stream) {
            self.transfer_recv(stream)?;
        }
        if ready.writable(stream) {
            self.transfer_send(stream)?;
        }
        Ok(())
    }

    fn transfer_recv(&mut self, mut stream: &TcpStream) -> Result<(), LinkError> {
        loop {
            match &mut self.recv {
                RecvState::Idle | RecvState::Received(_) => return Ok(()),
                RecvState::Header { buf, filled } => {
                    match stream.read(&mut buf[*filled..]) {
                        Ok(0) => return Err(LinkError::ConnectionLost),
                        Ok(n) => *filled += n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                    if *filled < HEADER_LEN {
                        continue;
                    }
                    let header = Header::parse(&buf[..])?;
                    let size = header.payload_size as usize;
                    if size > MAX_PAYLOAD_BYTES {
                        return Err(LinkError::PayloadTooLarge {
                            max_bytes: MAX_PAYLOAD_BYTES,
                            got_bytes: size,
                        });
                    }
                    self.recv = if size == 0 {
                        RecvState::Received(Msg::from_parts(header, Vec::new()))
                    } else {
                        RecvState::Payload {
                            header,
                            buf: vec![0; size],
                            filled: 0,
                        }
                    };
                }
                RecvState::Payload {
                    header,
                    buf,
                    filled,
                } => {
                    match stream.read(&mut buf[*filled..]) {
                        Ok(0) => return Err(LinkError::ConnectionLost),
                        Ok(n) => *filled += n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                    if *filled < buf.len() {
                        continue;
                    }
                    let header = *header;
                    let elements = parse_payload(buf)?;
                    self.recv = RecvState::Received(Msg::from_parts(header, elements));
                }
            }
        }
    }

    fn transfer_send(&mut self, mut stream: &TcpStream) -> Result<(), LinkError> {
        loop {
            match &mut self.send {
                SendState::Idle => return Ok(()),
                SendState::Sending { frame, written } => {
                    match stream.write(&frame[*written..]) {
                        Ok(0) => return Err(LinkError::ConnectionLost),
                        Ok(n) => *written += n,
                        Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                    if *written == frame.len() {
                        self.send = SendState::Idle;
                    }
                }
            }
        }
    }
}

impl Default for MsgTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::MsgType;
    use std::net::TcpListener;
    use std::os::fd::AsFd;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).unwrap();
        let (b, _) = listener.accept().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    fn pump(
        tx: &mut MsgTransport,
        tx_stream: &TcpStream,
        rx: &mut MsgTransport,
        rx_stream: &TcpStream,
    ) -> Msg {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            assert!(std::time::Instant::now() < deadline, "transfer stalled");
            let mut sel = Selector::new();
            sel.lower_timeout_ms(100);
            tx.update_selector(tx_stream.as_fd(), &mut sel);
            rx.update_selector(rx_stream.as_fd(), &mut sel);
            let ready = sel.wait().unwrap();
            tx.transfer(tx_stream, &ready).unwrap();
            rx.transfer(rx_stream, &ready).unwrap();
            if let Some(msg) = rx.take_received() {
                return msg;
            }
        }
    }

    #[test]
    fn message_crosses_the_socket() {
        let (a, b) = socket_pair();
        let mut tx = MsgTransport::new();
        let mut rx = MsgTransport::new();

        let msg = Msg::new(MsgType::command(100)).with_str("ping").with_u64(7);
        tx.send_msg(&msg).unwrap();
        rx.begin_recv();

        let received = pump(&mut tx, &a, &mut rx, &b);
        assert_eq!(received, msg);
        assert!(tx.ready_to_send());
        assert!(!rx.is_receiving());
    }

    #[test]
    fn second_send_while_sending_is_refused() {
        let mut tx = MsgTransport::new();
        let msg = Msg::new(MsgType::command(1));
        tx.send_msg(&msg).unwrap();
        assert!(matches!(tx.send_msg(&msg), Err(LinkError::SendBusy)));
    }

    #[test]
    fn begin_recv_does_not_restart_in_flight_receive() {
        let mut rx = MsgTransport::new();
        rx.begin_recv();
        assert!(rx.is_receiving());
        rx.begin_recv();
        assert!(rx.is_receiving() && !rx.done_receiving());
    }

    #[test]
    fn oversize_header_is_a_framing_error() {
        let (a, b) = socket_pair();
        let mut rx = MsgTransport::new();
        rx.begin_recv();

        // Header claiming a 200 MiB payload.
        let mut header = Vec::new();
        header.extend_from_slice(&1u32.to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());
        header.extend_from_slice(&0x3000_0001u32.to_be_bytes());
        header.extend_from_slice(&9u64.to_be_bytes());
        header.extend_from_slice(&(200u32 * 1024 * 1024).to_be_bytes());
        {
            let mut a_ref = &a;
            a_ref.write_all(&header).unwrap();
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            assert!(std::time::Instant::now() < deadline, "never saw the error");
            let mut sel = Selector::new();
            sel.lower_timeout_ms(100);
            rx.update_selector(b.as_fd(), &mut sel);
            let ready = sel.wait().unwrap();
            match rx.transfer(&b, &ready) {
                Ok(()) => continue,
                Err(LinkError::PayloadTooLarge { got_bytes, .. }) => {
                    assert_eq!(got_bytes, 200 * 1024 * 1024);
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn peer_shutdown_is_connection_lost() {
        let (a, b) = socket_pair();
        let mut rx = MsgTransport::new();
        rx.begin_recv();
        drop(a);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            assert!(std::time::Instant::now() < deadline, "never saw the close");
            let mut sel = Selector::new();
            sel.lower_timeout_ms(100);
            rx.update_selector(b.as_fd(), &mut sel);
            let ready = sel.wait().unwrap();
            match rx.transfer(&b, &ready) {
                Ok(()) => continue,
                Err(LinkError::ConnectionLost) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
    }
}
