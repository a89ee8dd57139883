use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Inner {
    counter: u16,
    signals: HashMap<u16, oneshot::Sender<()>>,
    waiters: HashMap<u16, oneshot::Receiver<()>>,
}

#[derive(Default)]
pub struct TransactionTracker {
    inner: Mutex<Inner>,
}

impl TransactionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next transaction id, wrapping after 65535. The first id handed out is 1.
    pub fn allocate(&self) -> u16 {
        let mut inner = self.lock();
        inner.counter = inner.counter.wrapping_add(1);
        inner.counter
    }

    pub fn register_wait(&self, id: u16) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.lock();
        inner.signals.insert(id, tx);
        inner.waiters.insert(id, rx);
    }

    /// Signals the waiter for `id`. Unknown or late ids are ignored.
    pub fn resolve(&self, id: u16) -> bool {
        let signal = self.lock().signals.remove(&id);
        match signal {
            Some(tx) => {
                // The receiver stays in `waiters` and sees the buffered signal.
                let _ = tx.send(());
                true
            }
            None => {
                debug!(txn = id, "Ack for unknown or expired transaction");
                false
            }
        }
    }

    /// Waits until `id` is acked or `timeout` elapses. Returns false on
    /// timeout; the entry is dropped either way and never retried.
    pub async fn wait(&self, id: u16, timeout: Duration) -> bool {
        let rx = {
            let mut inner = self.lock();
            match inner.waiters.remove(&id) {
                Some(rx) => rx,
                None => {
                    let (tx, rx) = oneshot::channel();
                    inner.signals.insert(id, tx);
                    rx
                }
            }
        };

        let acked = matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())));
        if !acked {
            self.lock().signals.remove(&id);
        }
        acked
    }

    pub fn abandon(&self, id: u16) {
        let mut inner = self.lock();
        inner.signals.remove(&id);
        inner.waiters.remove(&id);
    }

    pub fn pending(&self) -> usize {
        self.lock().signals.len()
    }
}
