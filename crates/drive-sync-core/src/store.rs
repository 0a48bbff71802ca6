use tokio::sync::watch;

/// Observable state container. Readers take snapshots or subscribe; the only
/// write path is [`Store::mutate`], which the concrete stores wrap in their
/// named operations.
#[derive(Debug)]
pub struct Store<T> {
    tx: watch::Sender<T>,
}

impl<T> Store<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub fn snapshot(&self) -> T
    where
        T: Clone,
    {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    /// Applies `f` and notifies subscribers only when it reports a change.
    pub(crate) fn mutate(&self, f: impl FnOnce(&mut T) -> bool) -> bool {
        self.tx.send_if_modified(f)
    }

    pub(crate) fn replace(&self, value: T) {
        self.tx.send_replace(value);
    }
}

impl<T: Default> Default for Store<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unchanged_mutations_do_not_notify() {
        let store = Store::new(0u32);
        let mut rx = store.subscribe();
        assert!(!store.mutate(|_| false));
        assert!(!rx.has_changed().expect("sender alive"));

        assert!(store.mutate(|value| {
            *value += 1;
            true
        }));
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[test]
    fn mutate_without_subscribers_still_applies() {
        let store = Store::new(String::new());
        store.mutate(|value| {
            value.push_str("abc");
            true
        });
        assert_eq!(store.snapshot(), "abc");
        store.replace("x".to_string());
        assert_eq!(store.read(|v| v.len()), 1);
    }
}
