//! Readiness selection over non-blocking sockets.
//!
//! A [`Selector`] is rebuilt for every worker turn: interests are registered,
//! `wait` blocks in `ppoll(2)`, and the resulting [`Readiness`] snapshot is
//! queried by raw fd. Error conditions are reported for every registered
//! socket whether or not they were asked for, so connection failures are
//! always observed.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, ppoll};
use nix::sys::time::TimeSpec;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SelectorError {
    #[error("poll failed: {0}")]
    Poll(#[from] Errno),
}

pub struct Selector<'fd> {
    entries: Vec<(BorrowedFd<'fd>, PollFlags)>,
    index: HashMap<RawFd, usize>,
    /// `None` blocks indefinitely.
    timeout: Option<Duration>,
}

impl<'fd> Selector<'fd> {
    pub fn new() -> Self {
        Selector {
            entries: Vec::new(),
            index: HashMap::new(),
            timeout: None,
        }
    }

    pub fn add_read(&mut self, fd: BorrowedFd<'fd>) {
        self.add(fd, PollFlags::POLLIN);
    }

    pub fn add_write(&mut self, fd: BorrowedFd<'fd>) {
        self.add(fd, PollFlags::POLLOUT);
    }

    fn add(&mut self, fd: BorrowedFd<'fd>, events: PollFlags) {
        match self.index.get(&fd.as_raw_fd()) {
            Some(&i) => self.entries[i].1 |= events,
            None => {
                self.index.insert(fd.as_raw_fd(), self.entries.len());
                self.entries.push((fd, events));
            }
        }
    }

    /// Shrink the stored timeout; never grows it.
    pub fn lower_timeout(&mut self, limit: Duration) {
        self.timeout = Some(match self.timeout {
            Some(current) => current.min(limit),
            None => limit,
        });
    }

    pub fn lower_timeout_ms(&mut self, ms: u64) {
        self.lower_timeout(Duration::from_millis(ms));
    }

    /// Block until a registered socket is ready or the timeout elapses.
    /// `EINTR` is retried; any other failure is fatal to the caller.
    pub fn wait(self) -> Result<Readiness, SelectorError> {
        let mut pollfds: Vec<PollFd<'_>> = self
            .entries
            .iter()
            .map(|&(fd, events)| PollFd::new(fd, events))
            .collect();
        let timeout = self.timeout.map(TimeSpec::from_duration);
        loop {
            match ppoll(&mut pollfds, timeout, None) {
                Ok(_) => break,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
        let mut revents = HashMap::with_capacity(pollfds.len());
        for (i, pollfd) in pollfds.iter().enumerate() {
            let flags = pollfd.revents().unwrap_or_else(PollFlags::empty);
            revents.insert(self.entries[i].0.as_raw_fd(), flags);
        }
        Ok(Readiness { revents })
    }
}

impl Default for Selector<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one `wait`. Predicates report true on the named condition or on
/// any error condition for that socket.
pub struct Readiness {
    revents: HashMap<RawFd, PollFlags>,
}

fn error_flags() -> PollFlags {
    PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL
}

impl Readiness {
    fn flags(&self, fd: &impl AsRawFd) -> PollFlags {
        self.revents
            .get(&fd.as_raw_fd())
            .copied()
            .unwrap_or_else(PollFlags::empty)
    }

    pub fn readable(&self, fd: &impl AsRawFd) -> bool {
        self.flags(fd).intersects(PollFlags::POLLIN | error_flags())
    }

    pub fn writable(&self, fd: &impl AsRawFd) -> bool {
        self.flags(fd).intersects(PollFlags::POLLOUT | error_flags())
    }

    pub fn readable_or_writable(&self, fd: &impl AsRawFd) -> bool {
        self.flags(fd)
            .intersects(PollFlags::POLLIN | PollFlags::POLLOUT | error_flags())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn readable_after_peer_writes() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();
        tx.write_all(&[1]).unwrap();

        let mut sel = Selector::new();
        sel.add_read(rx.as_fd());
        sel.lower_timeout_ms(1_000);
        let ready = sel.wait().unwrap();
        assert!(ready.readable(&rx));
    }

    #[test]
    fn timeout_elapses_without_events() {
        let (_tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let mut sel = Selector::new();
        sel.add_read(rx.as_fd());
        sel.lower_timeout_ms(50);
        let start = Instant::now();
        let ready = sel.wait().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(!ready.readable(&rx));
    }

    #[test]
    fn lower_timeout_never_increases() {
        let mut sel = Selector::new();
        sel.lower_timeout_ms(10);
        sel.lower_timeout_ms(500);
        assert_eq!(sel.timeout, Some(Duration::from_millis(10)));
    }

    #[test]
    fn write_interest_on_idle_socket() {
        let (tx, _rx) = UnixStream::pair().unwrap();
        tx.set_nonblocking(true).unwrap();

        let mut sel = Selector::new();
        sel.add_write(tx.as_fd());
        sel.lower_timeout_ms(1_000);
        let ready = sel.wait().unwrap();
        assert!(ready.writable(&tx));
        assert!(ready.readable_or_writable(&tx));
    }

    #[test]
    fn unregistered_fd_reports_nothing() {
        let (tx, rx) = UnixStream::pair().unwrap();
        let mut sel = Selector::new();
        sel.add_write(tx.as_fd());
        sel.lower_timeout_ms(100);
        let ready = sel.wait().unwrap();
        assert!(!ready.readable(&rx));
        assert!(!ready.writable(&rx));
    }
}
