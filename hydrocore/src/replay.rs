//! Hot broadcast channel with last-value replay.
//!
//! Every stream in the core uses this: late subscribers receive the most
//! recently published value before any live values, so a consumer that
//! attaches after data has already arrived never sees a false "nothing yet".

use std::sync::Mutex;

use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 64;

pub struct ReplayChannel<T> {
    tx: broadcast::Sender<T>,
    last: Mutex<Option<T>>,
}

impl<T: Clone> ReplayChannel<T> {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(DEFAULT_CAPACITY);
        Self {
            tx,
            last: Mutex::new(None),
        }
    }

    pub fn publish(&self, value: T) {
        *self.last.lock().unwrap() = Some(value.clone());
        // A send error only means there are no live subscribers yet; the
        // value is still cached for replay.
        let _ = self.tx.send(value);
    }

    /// Attaches a new subscriber. The broadcast receiver is created before
    /// the cache snapshot, so a concurrent publish can at worst duplicate the
    /// current value, never lose it.
    pub fn subscribe(&self) -> ReplayReceiver<T> {
        let rx = self.tx.subscribe();
        let pending = self.last.lock().unwrap().clone();
        ReplayReceiver { pending, rx }
    }

    pub fn last(&self) -> Option<T> {
        self.last.lock().unwrap().clone()
    }
}

impl<T: Clone> Default for ReplayChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReplayReceiver<T> {
    pending: Option<T>,
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> ReplayReceiver<T> {
    /// Next value, starting with the replayed one. `None` once the channel
    /// is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        if let Some(value) = self.pending.take() {
            return Some(value);
        }
        loop {
            match self.rx.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "stream subscriber lagged, skipping to live values");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(value) = self.pending.take() {
            return Some(value);
        }
        loop {
            match self.rx.try_recv() {
                Ok(value) => return Some(value),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
