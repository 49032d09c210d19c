//! Per-bundle transition observers.
//!
//! Observers only see transitions published after they subscribed; there is
//! no replay. A [`StateStream`] is an observer that forwards into a channel
//! and ends after the first terminal state.

use futures_util::Stream;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::models::{BundleId, DownloadState};

type Callback = Arc<dyn Fn(&DownloadState) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    observers: HashMap<BundleId, Vec<(u64, Callback)>>,
}

/// Observers keyed by bundle. Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
    inner: Arc<Mutex<Registry>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `on_transition` for `bundle_id`. The observer stays registered
    /// for as long as the returned handle is alive.
    pub fn subscribe<F>(&self, bundle_id: BundleId, on_transition: F) -> ObserverHandle
    where
        F: Fn(&DownloadState) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.inner);
        registry.next_id += 1;
        let id = registry.next_id;
        registry
            .observers
            .entry(bundle_id.clone())
            .or_default()
            .push((id, Arc::new(on_transition)));

        ObserverHandle {
            registry: Arc::downgrade(&self.inner),
            bundle_id,
            id,
        }
    }

    /// Opens a stream of the transitions published for `bundle_id` from now on.
    pub fn stream(&self, bundle_id: BundleId) -> StateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(bundle_id, move |state| {
            let _ = tx.send(state.clone());
        });
        StateStream {
            rx,
            _handle: handle,
            done: false,
        }
    }

    /// Delivers `state` to every observer of `bundle_id`.
    ///
    /// Callbacks run outside the registry lock, so they may subscribe or
    /// unsubscribe themselves.
    pub fn publish(&self, bundle_id: &BundleId, state: &DownloadState) {
        let callbacks: Vec<Callback> = {
            let registry = lock(&self.inner);
            match registry.observers.get(bundle_id) {
                Some(observers) => observers.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(state);
        }
    }

    #[cfg(test)]
    pub(crate) fn observer_count(&self, bundle_id: &BundleId) -> usize {
        lock(&self.inner)
            .observers
            .get(bundle_id)
            .map_or(0, Vec::len)
    }

    /// Drops every observer. Open state streams end.
    pub fn clear(&self) {
        lock(&self.inner).observers.clear();
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps an observer registered. Dropping it unsubscribes.
#[must_use = "the observer is removed as soon as the handle is dropped"]
pub struct ObserverHandle {
    registry: Weak<Mutex<Registry>>,
    bundle_id: BundleId,
    id: u64,
}

impl ObserverHandle {
    pub fn bundle_id(&self) -> &BundleId {
        &self.bundle_id
    }

    pub fn unsubscribe(self) {}
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = lock(&registry);
        if let Some(observers) = registry.observers.get_mut(&self.bundle_id) {
            observers.retain(|(id, _)| *id != self.id);
            if observers.is_empty() {
                registry.observers.remove(&self.bundle_id);
            }
        }
    }
}

/// Transitions of one bundle, ending after the first terminal state.
pub struct StateStream {
    rx: mpsc::UnboundedReceiver<DownloadState>,
    _handle: ObserverHandle,
    done: bool,
}

impl StateStream {
    /// Drains the stream and returns the last state seen, normally the
    /// terminal one. `None` if the stream ended without any transition.
    pub async fn settle(mut self) -> Option<DownloadState> {
        let mut last = None;
        while let Some(state) = self.next().await {
            last = Some(state);
        }
        last
    }
}

impl Stream for StateStream {
    type Item = DownloadState;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(state)) => {
                if state.is_terminal() {
                    self.done = true;
                }
                Poll::Ready(Some(state))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn observers_are_keyed_by_bundle() {
        let registry = ObserverRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _handle = registry.subscribe("Essential".into(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.publish(&"Essential".into(), &DownloadState::Checking);
        registry.publish(&"Prefetch".into(), &DownloadState::Checking);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_the_handle_unsubscribes() {
        let registry = ObserverRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handle = registry.subscribe("OnDemand".into(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        registry.publish(&"OnDemand".into(), &DownloadState::Checking);
        handle.unsubscribe();
        registry.publish(&"OnDemand".into(), &DownloadState::Finished);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.observer_count(&"OnDemand".into()), 0);
    }

    #[test]
    fn callbacks_may_unsubscribe_from_inside_publish() {
        let registry = ObserverRegistry::new();
        let slot: Arc<Mutex<Option<ObserverHandle>>> = Arc::new(Mutex::new(None));
        let inner_slot = slot.clone();
        let handle = registry.subscribe("Essential".into(), move |_| {
            inner_slot.lock().unwrap().take();
        });
        *slot.lock().unwrap() = Some(handle);

        registry.publish(&"Essential".into(), &DownloadState::Checking);
        assert_eq!(registry.observer_count(&"Essential".into()), 0);
    }

    #[tokio::test]
    async fn stream_ends_after_terminal_state() {
        let registry = ObserverRegistry::new();
        let stream = registry.stream("Essential".into());
        let id = BundleId::from("Essential");

        registry.publish(&id, &DownloadState::Checking);
        registry.publish(&id, &DownloadState::Finished);
        registry.publish(&id, &DownloadState::Checking);

        let seen: Vec<_> = stream.collect().await;
        assert_eq!(seen, vec![DownloadState::Checking, DownloadState::Finished]);
    }

    #[tokio::test]
    async fn no_replay_for_late_subscribers() {
        let registry = ObserverRegistry::new();
        let id = BundleId::from("Prefetch");
        registry.publish(&id, &DownloadState::Checking);

        let stream = registry.stream(id.clone());
        registry.publish(&id, &DownloadState::Removed);
        assert_eq!(stream.settle().await, Some(DownloadState::Removed));
    }

    #[tokio::test]
    async fn clearing_ends_open_streams() {
        let registry = ObserverRegistry::new();
        let stream = registry.stream("OnDemand".into());
        registry.clear();
        assert_eq!(stream.settle().await, None);
    }
}
