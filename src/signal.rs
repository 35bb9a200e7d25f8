//! Observable value cell used for every piece of engine state.
//!
//! A [`Signal`] is a thin wrapper around a `tokio::sync::watch` sender: reads
//! borrow the current value, writes notify every subscriber, and a
//! [`Selector`] re-projects the value and only wakes up when the projection
//! actually changes.

use std::fmt;
use tokio::sync::watch;

pub struct Signal<T> {
    tx: watch::Sender<T>,
}

impl<T> Signal<T> {
    pub fn new(value: T) -> Self {
        let (tx, _rx) = watch::channel(value);
        Signal { tx }
    }

    /// Reads the current value without cloning it.
    ///
    /// The closure must not touch this signal again.
    pub fn with<R>(&self, read: impl FnOnce(&T) -> R) -> R {
        read(&self.tx.borrow())
    }

    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    /// Replaces the value with one derived from the current value.
    pub fn set_with(&self, updater: impl FnOnce(&T) -> T) {
        self.tx.send_modify(|value| *value = updater(value));
    }

    /// Edits the value in place and notifies subscribers.
    pub fn mutate(&self, edit: impl FnOnce(&mut T)) {
        self.tx.send_modify(edit);
    }

    /// Edits in place; subscribers are only notified when `edit` returns true.
    pub fn mutate_if(&self, edit: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(edit)
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Clone> Signal<T> {
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }
}

impl<T> Signal<T> {
    /// Derived view over this signal that only reports changes of `project(value)`.
    pub fn selector<R, F>(&self, project: F) -> Selector<T, R>
    where
        R: PartialEq + Clone,
        F: Fn(&T) -> R + Send + Sync + 'static,
    {
        let mut rx = self.tx.subscribe();
        let last = project(&rx.borrow_and_update());
        Selector {
            rx,
            project: Box::new(project),
            last,
        }
    }
}

impl<T: Default> Default for Signal<T> {
    fn default() -> Self {
        Signal::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signal").field(&*self.tx.borrow()).finish()
    }
}

pub struct Selector<T, R> {
    rx: watch::Receiver<T>,
    project: Box<dyn Fn(&T) -> R + Send + Sync>,
    last: R,
}

impl<T, R: PartialEq + Clone> Selector<T, R> {
    /// Last projected value seen by this selector.
    pub fn current(&self) -> R {
        self.last.clone()
    }

    /// Waits until the projected value differs from the last one.
    ///
    /// Returns `None` once the underlying signal is dropped.
    pub async fn changed(&mut self) -> Option<R> {
        loop {
            self.rx.changed().await.ok()?;
            let next = (self.project)(&self.rx.borrow_and_update());
            if next != self.last {
                self.last = next.clone();
                return Some(next);
            }
        }
    }

    /// Re-projects immediately, without waiting for a notification.
    pub fn refresh(&mut self) -> R {
        let next = (self.project)(&self.rx.borrow_and_update());
        self.last = next.clone();
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Bounds {
        min: usize,
        max: usize,
    }

    #[test]
    fn set_and_mutate_are_visible_to_readers() {
        let signal = Signal::new(Bounds::default());
        signal.set(Bounds { min: 1, max: 4 });
        assert_eq!(signal.with(|b| b.max), 4);

        signal.mutate(|b| b.min = 2);
        signal.set_with(|b| Bounds { min: b.min, max: b.max * 2 });
        assert_eq!(signal.get(), Bounds { min: 2, max: 8 });
    }

    #[test]
    fn mutate_if_reports_whether_anything_changed() {
        let signal = Signal::new(0u32);
        assert!(!signal.mutate_if(|_| false));
        assert!(signal.mutate_if(|v| {
            *v += 1;
            true
        }));
        assert_eq!(signal.get(), 1);
    }

    #[tokio::test]
    async fn selector_skips_unrelated_changes() {
        let signal = Signal::new(Bounds::default());
        let mut min = signal.selector(|b: &Bounds| b.min);
        assert_eq!(min.current(), 0);

        // only max moves, selector stays quiet
        signal.mutate(|b| b.max = 10);
        signal.mutate(|b| b.min = 3);
        assert_eq!(min.changed().await, Some(3));
        assert_eq!(min.current(), 3);
    }

    #[tokio::test]
    async fn selector_ends_when_signal_is_dropped() {
        let signal = Signal::new(1u8);
        let mut selector = signal.selector(|v: &u8| *v);
        drop(signal);
        assert_eq!(selector.changed().await, None);
    }
}
