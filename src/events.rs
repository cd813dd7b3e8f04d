use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

/// Payload-free notifications passed between components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// The store changed; listeners re-read it.
    DataUpdated,
    ToggleViewer,
}

/// Fire-and-forget publish/subscribe hub.
///
/// Each subscriber gets a single-slot channel per signal kind, so a burst of
/// identical signals collapses into one pending delivery.
#[derive(Default)]
pub struct Bus {
    subscribers: Mutex<Vec<Subscriber>>,
}

struct Subscriber {
    data: Sender<Signal>,
    toggle: Sender<Signal>,
}

/// Receiving half handed out by [`Bus::subscribe`].
#[derive(Clone)]
pub struct Subscription {
    pub data: Receiver<Signal>,
    pub toggle: Receiver<Signal>,
}

impl Subscription {
    /// Drains whatever is pending without blocking.
    pub fn pending(&self) -> Vec<Signal> {
        let mut out = Vec::new();
        if self.toggle.try_recv().is_ok() {
            out.push(Signal::ToggleViewer);
        }
        if self.data.try_recv().is_ok() {
            out.push(Signal::DataUpdated);
        }
        out
    }
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (data_tx, data_rx) = bounded(1);
        let (toggle_tx, toggle_rx) = bounded(1);
        self.subscribers.lock().push(Subscriber {
            data: data_tx,
            toggle: toggle_tx,
        });
        Subscription {
            data: data_rx,
            toggle: toggle_rx,
        }
    }

    pub fn publish(&self, signal: Signal) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sub| {
            let tx = match signal {
                Signal::DataUpdated => &sub.data,
                Signal::ToggleViewer => &sub.toggle,
            };
            match tx.try_send(signal) {
                Ok(()) | Err(TrySendError::Full(_)) => true,
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}
