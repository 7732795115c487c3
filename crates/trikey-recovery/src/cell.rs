//! Observable machine state

use std::fmt::Debug;
use tokio::sync::watch;

/// Holds a machine's current state and publishes every transition.
pub struct StateCell<S> {
    name: &'static str,
    tx: watch::Sender<S>,
}

impl<S: Clone + Debug + PartialEq> StateCell<S> {
    pub fn new(name: &'static str, initial: S) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { name, tx }
    }

    pub fn get(&self) -> S {
        self.tx.borrow().clone()
    }

    pub fn set(&self, next: S) {
        let changed = *self.tx.borrow() != next;
        if changed {
            log::info!("{}: -> {:?}", self.name, next);
        }
        self.tx.send_replace(next);
    }

    /// Follow transitions (e.g. to render `Canceling` while a call is out)
    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.tx.subscribe()
    }
}
