//! Wake signals: a capacity-1 channel per task type.
//!
//! A signal carries no data. It only tells the worker to poll now instead of
//! waiting for its next scheduled fetch. Any number of wake-ups sent before
//! the worker gets to it collapse into a single buffered signal.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeResult {
    /// A signal is now buffered.
    Sent,
    /// A signal was already buffered; nothing changed.
    Coalesced,
    /// The worker side is gone.
    Closed,
}

#[derive(Debug, Clone)]
pub struct WakeSender {
    tx: mpsc::Sender<()>,
}

#[derive(Debug)]
pub struct WakeReceiver {
    rx: mpsc::Receiver<()>,
}

pub fn wake_channel() -> (WakeSender, WakeReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (WakeSender { tx }, WakeReceiver { rx })
}

impl WakeSender {
    /// Never blocks.
    pub fn wake(&self) -> WakeResult {
        match self.tx.try_send(()) {
            Ok(()) => WakeResult::Sent,
            Err(TrySendError::Full(())) => WakeResult::Coalesced,
            Err(TrySendError::Closed(())) => WakeResult::Closed,
        }
    }
}

impl WakeReceiver {
    /// `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<()> {
        self.rx.recv().await
    }

    /// Take the buffered signal, if any.
    pub fn try_recv(&mut self) -> bool {
        match self.rx.try_recv() {
            Ok(()) => true,
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => false,
        }
    }
}
