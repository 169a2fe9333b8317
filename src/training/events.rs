//! Epoch-boundary notification
//!
//! The training loop owns an `EpochNotifier`; trackers register with it and
//! receive every `new_epoch` synchronously, in registration order.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::RegimenId;

/// Receiver of epoch-start events
pub trait EpochListener {
    /// A training regimen is starting an epoch of `num_sents` sentences
    fn on_new_epoch(&mut self, regimen: RegimenId, num_sents: usize);
}

/// Synchronous publisher of epoch-start events
#[derive(Default)]
pub struct EpochNotifier {
    listeners: Vec<Rc<RefCell<dyn EpochListener>>>,
}

impl EpochNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, listener: Rc<RefCell<dyn EpochListener>>) {
        self.listeners.push(listener);
    }

    /// Invoke every registered listener before returning
    pub fn new_epoch(&self, regimen: RegimenId, num_sents: usize) {
        log::debug!(
            "New epoch for {} ({} sentences, {} listeners)",
            regimen,
            num_sents,
            self.listeners.len()
        );
        for listener in &self.listeners {
            listener.borrow_mut().on_new_epoch(regimen, num_sents);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

impl fmt::Debug for EpochNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpochNotifier")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Vec<(RegimenId, usize)>,
    }

    impl EpochListener for Recorder {
        fn on_new_epoch(&mut self, regimen: RegimenId, num_sents: usize) {
            self.seen.push((regimen, num_sents));
        }
    }

    #[test]
    fn test_notifies_every_listener_in_order() {
        let first = Rc::new(RefCell::new(Recorder::default()));
        let second = Rc::new(RefCell::new(Recorder::default()));

        let mut notifier = EpochNotifier::new();
        notifier.register(first.clone());
        notifier.register(second.clone());
        assert_eq!(notifier.len(), 2);

        notifier.new_epoch(RegimenId(1), 10);
        notifier.new_epoch(RegimenId(2), 20);

        assert_eq!(first.borrow().seen, vec![(RegimenId(1), 10), (RegimenId(2), 20)]);
        assert_eq!(second.borrow().seen, first.borrow().seen);
    }
}
