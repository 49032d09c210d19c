//! Scriptable [`BundleClient`] for tests.
//!
//! ```rust,ignore
//! let client = MockBundleClient::new();
//! client.add_bundle("OnDemand", b"image bytes".to_vec());
//! client.set_status_events("OnDemand", vec![StatusEvent::Began, StatusEvent::Finished]);
//! let gate = client.gate_availability("OnDemand");
//! // ... start a download, observe progress ...
//! gate.open();
//! ```

use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::Semaphore;

use crate::client::{BundleClient, ClientError, StatusStream};
use crate::models::{BundleId, BundleMetadata, StatusEvent};

/// The client call a scripted failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    Metadata,
    Availability,
    Content,
    Remove,
}

/// A recorded client call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub step: MockStep,
    pub target: String,
}

/// Holds `ensure_local_availability` for a bundle until opened.
#[derive(Clone)]
pub struct AvailabilityGate {
    permits: Arc<Semaphore>,
}

impl AvailabilityGate {
    /// Lets one pending or future availability call through.
    pub fn open(&self) {
        self.permits.add_permits(1);
    }
}

#[derive(Default)]
struct MockState {
    metadata: HashMap<BundleId, BundleMetadata>,
    content: HashMap<String, Vec<u8>>,
    failures: HashMap<(BundleId, MockStep), VecDeque<ClientError>>,
    status_events: HashMap<BundleId, (Vec<StatusEvent>, bool)>,
    gates: HashMap<BundleId, Arc<Semaphore>>,
    calls: Vec<MockCall>,
    subscriptions: HashMap<BundleId, usize>,
}

#[derive(Default)]
pub struct MockBundleClient {
    state: Mutex<MockState>,
    live_streams: Arc<AtomicUsize>,
}

impl MockBundleClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a bundle whose content lives at `AssetPacks/<id>/content.bin`.
    pub fn add_bundle(&self, id: impl Into<BundleId>, content: Vec<u8>) -> BundleMetadata {
        let id = id.into();
        let path = format!("AssetPacks/{}/content.bin", id);
        let metadata = BundleMetadata::new(id.clone())
            .with_content_path(path.clone())
            .with_size(content.len() as u64);
        let mut state = self.state();
        state.metadata.insert(id, metadata.clone());
        state.content.insert(path, content);
        metadata
    }

    /// Registers metadata only; content must be added with [`Self::set_content`].
    pub fn add_metadata(&self, metadata: BundleMetadata) {
        self.state().metadata.insert(metadata.id.clone(), metadata);
    }

    pub fn set_content(&self, path: impl Into<String>, content: Vec<u8>) {
        self.state().content.insert(path.into(), content);
    }

    /// The next call of `step` for `id` fails with `error`. Queued failures
    /// are used up in order.
    pub fn fail_next(&self, id: impl Into<BundleId>, step: MockStep, error: ClientError) {
        self.state()
            .failures
            .entry((id.into(), step))
            .or_default()
            .push_back(error);
    }

    /// Events each status subscription for `id` yields before closing.
    pub fn set_status_events(&self, id: impl Into<BundleId>, events: Vec<StatusEvent>) {
        self.state().status_events.insert(id.into(), (events, false));
    }

    /// Like [`Self::set_status_events`], but the stream stays open afterwards.
    pub fn set_status_events_open(&self, id: impl Into<BundleId>, events: Vec<StatusEvent>) {
        self.state().status_events.insert(id.into(), (events, true));
    }

    /// Makes `ensure_local_availability` for `id` wait until the gate opens.
    pub fn gate_availability(&self, id: impl Into<BundleId>) -> AvailabilityGate {
        let permits = Arc::new(Semaphore::new(0));
        self.state().gates.insert(id.into(), permits.clone());
        AvailabilityGate { permits }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, step: MockStep, target: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.step == step && c.target == target)
            .count()
    }

    /// How many status subscriptions were opened for `id`.
    pub fn subscription_count(&self, id: &str) -> usize {
        self.state()
            .subscriptions
            .get(&BundleId::from(id))
            .copied()
            .unwrap_or(0)
    }

    /// Status streams not yet dropped.
    pub fn live_status_streams(&self) -> usize {
        self.live_streams.load(Ordering::SeqCst)
    }

    fn record(&self, step: MockStep, target: &str) -> Option<ClientError> {
        let mut state = self.state();
        state.calls.push(MockCall {
            step,
            target: target.to_string(),
        });
        state
            .failures
            .get_mut(&(BundleId::from(target), step))
            .and_then(VecDeque::pop_front)
    }
}

#[async_trait]
impl BundleClient for MockBundleClient {
    async fn fetch_metadata(&self, id: &BundleId) -> Result<BundleMetadata, ClientError> {
        if let Some(error) = self.record(MockStep::Metadata, id.as_str()) {
            return Err(error);
        }
        self.state()
            .metadata
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(id.to_string()))
    }

    async fn ensure_local_availability(&self, metadata: &BundleMetadata) -> Result<(), ClientError> {
        let failure = self.record(MockStep::Availability, metadata.id.as_str());
        let gate = self.state().gates.get(&metadata.id).cloned();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn read_content(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        // Failures for content are scripted per bundle; the bundle is the
        // second path segment of the default layout.
        let bundle = path.split('/').nth(1).unwrap_or(path);
        let mut state = self.state();
        state.calls.push(MockCall {
            step: MockStep::Content,
            target: path.to_string(),
        });
        if let Some(error) = state
            .failures
            .get_mut(&(BundleId::from(bundle), MockStep::Content))
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        state
            .content
            .get(path)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(path.to_string()))
    }

    fn status_updates(&self, id: &BundleId) -> StatusStream {
        let mut state = self.state();
        *state.subscriptions.entry(id.clone()).or_default() += 1;
        let (events, stay_open) = state.status_events.get(id).cloned().unwrap_or_default();
        drop(state);

        let events = stream::iter(events);
        let inner = if stay_open {
            events.chain(stream::pending()).boxed()
        } else {
            events.boxed()
        };
        self.live_streams.fetch_add(1, Ordering::SeqCst);
        Box::pin(TrackedStream {
            inner,
            live: self.live_streams.clone(),
        })
    }

    async fn remove(&self, id: &BundleId) -> Result<(), ClientError> {
        match self.record(MockStep::Remove, id.as_str()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Counts itself in `live` until dropped.
struct TrackedStream {
    inner: StatusStream,
    live: Arc<AtomicUsize>,
}

impl Stream for TrackedStream {
    type Item = StatusEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
