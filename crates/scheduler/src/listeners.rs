//! The listener bus: fan-out of state-change and scheduling-action
//! notifications to registered observers. Delivery is best-effort and
//! unordered across subscribers, ordered per subscriber. Observers are
//! injected collectors, so there is no global mutable state to reset
//! between tests.

use crate::machine::Action;
use models::{StatusSnapshot, ViewPath};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One bus notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    /// The view's state variant changed.
    StateChanged {
        view: ViewPath,
        previous: StatusSnapshot,
        next: StatusSnapshot,
    },
    /// A step produced scheduling actions.
    ActionsIssued {
        view: ViewPath,
        previous: StatusSnapshot,
        next: StatusSnapshot,
        actions: Vec<Action>,
        timestamp: i64,
    },
}

/// Cheap-to-clone handle on the bus shared by every supervisor.
#[derive(Clone, Default)]
pub struct ListenerBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<BusEvent>>>>,
}

impl ListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Events published after this call are delivered
    /// in publish order until the receiver is dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<BusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber, pruning closed ones.
    pub fn publish(&self, event: BusEvent) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
