//! Owner-thread dispatch collaborator.
//!
//! The worker thread never touches broker state directly: it submits
//! callables through a [`Dispatcher`], and the embedding application runs
//! them on whatever thread owns the broker (a UI thread, a main-loop thread,
//! a test harness).

use crossbeam::channel::{Receiver, Sender, unbounded};

pub type DispatchTask = Box<dyn FnOnce() + Send>;

/// Serializes submitted callables onto the single logical owner thread.
pub trait Dispatcher: Send + Sync {
    fn submit(&self, task: DispatchTask);
}

/// Queue-backed dispatcher for embedders without a native event loop. The
/// owner thread drains it explicitly via [`QueueDispatcher::run_pending`].
#[derive(Clone)]
pub struct QueueDispatcher {
    tx: Sender<DispatchTask>,
    rx: Receiver<DispatchTask>,
}

impl QueueDispatcher {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        QueueDispatcher { tx, rx }
    }

    /// Run all queued tasks; returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Run the next task, waiting up to `timeout` for one to arrive.
    pub fn run_next(&self, timeout: std::time::Duration) -> bool {
        match self.rx.recv_timeout(timeout) {
            Ok(task) => {
                task();
                true
            }
            Err(_) => false,
        }
    }
}

impl Default for QueueDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher for QueueDispatcher {
    fn submit(&self, task: DispatchTask) {
        let _ = self.tx.send(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn tasks_run_in_submission_order() {
        let dispatcher = QueueDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let seen = Arc::clone(&seen);
            dispatcher.submit(Box::new(move || seen.lock().unwrap().push(i)));
        }
        assert_eq!(dispatcher.run_pending(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn run_next_times_out_when_empty() {
        let dispatcher = QueueDispatcher::new();
        assert!(!dispatcher.run_next(std::time::Duration::from_millis(10)));
    }
}
