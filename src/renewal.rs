//! Background lease renewal threads.

use crate::Result;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Cancellation side seen by the renewal thread.
pub struct Stop {
    rx: Receiver<()>,
}

impl Stop {
    /// Sleeps for up to `d`. Returns true as soon as cancellation is requested.
    pub fn wait(&self, d: Duration) -> bool {
        !matches!(self.rx.recv_timeout(d), Err(RecvTimeoutError::Timeout))
    }

    pub fn requested(&self) -> bool {
        !matches!(self.rx.try_recv(), Err(TryRecvError::Empty))
    }
}

/// Handle to a running renewal thread. Dropping it cancels the thread.
pub struct Renewal {
    tx: Option<Sender<()>>,
    handle: JoinHandle<()>,
}

impl Renewal {
    pub fn spawn<F>(label: String, f: F) -> Result<Self>
    where
        F: FnOnce(Stop) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(label)
            .spawn(move || f(Stop { rx }))?;

        Ok(Self {
            tx: Some(tx),
            handle,
        })
    }

    /// Idempotent. The thread exits at its next wait point; an in-flight
    /// store call is not interrupted.
    pub fn cancel(&mut self) {
        self.tx.take();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for Renewal {
    fn drop(&mut self) {
        self.cancel();
    }
}
