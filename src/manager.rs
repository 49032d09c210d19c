// src/manager.rs

use futures_util::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::client::{BundleClient, ClientError, StatusStream};
use crate::config::BundleSpec;
use crate::integrity::{verify_content, ContentExpectation};
use crate::models::{
    BundleId, BundleMetadata, DownloadPolicy, DownloadState, FailureDetail, FailureKind,
    FailurePhase, SessionSnapshot,
};
use crate::observer::{ObserverHandle, ObserverRegistry, StateStream};
use crate::session::DownloadSession;

type SharedSession = Arc<Mutex<DownloadSession>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptMode {
    Check,
    WithProgress,
}

impl AttemptMode {
    fn as_str(&self) -> &'static str {
        match self {
            AttemptMode::Check => "check",
            AttemptMode::WithProgress => "download",
        }
    }
}

/// Owns one [`DownloadSession`] per bundle and drives it through the bundle
/// client. Operations on different bundles never wait on each other.
pub struct OrchestrationManager {
    client: Arc<dyn BundleClient>,
    catalog: HashMap<BundleId, BundleSpec>,
    sessions: Mutex<HashMap<BundleId, SharedSession>>,
    observers: ObserverRegistry,
}

impl OrchestrationManager {
    pub fn new(client: Arc<dyn BundleClient>) -> Self {
        Self::with_catalog(client, Vec::new())
    }

    pub fn with_catalog(client: Arc<dyn BundleClient>, bundles: Vec<BundleSpec>) -> Self {
        let catalog = bundles
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();
        Self {
            client,
            catalog,
            sessions: Mutex::new(HashMap::new()),
            observers: ObserverRegistry::new(),
        }
    }

    /// Catalog entries, sorted by bundle id.
    pub fn catalog(&self) -> Vec<&BundleSpec> {
        let mut specs: Vec<_> = self.catalog.values().collect();
        specs.sort_by(|a, b| a.id.cmp(&b.id));
        specs
    }

    /// Calls `on_transition` for every later transition of `bundle_id`.
    pub fn subscribe<F>(&self, bundle_id: impl Into<BundleId>, on_transition: F) -> ObserverHandle
    where
        F: Fn(&DownloadState) + Send + Sync + 'static,
    {
        self.observers.subscribe(bundle_id.into(), on_transition)
    }

    /// Fetches metadata, makes the bundle local and reads its content.
    pub async fn check_availability(self: &Arc<Self>, bundle_id: impl Into<BundleId>) -> StateStream {
        self.start_attempt(bundle_id.into(), AttemptMode::Check).await
    }

    /// Like [`check_availability`](Self::check_availability), and relays
    /// transfer progress while the bundle is being made local.
    pub async fn download_with_progress(
        self: &Arc<Self>,
        bundle_id: impl Into<BundleId>,
    ) -> StateStream {
        self.start_attempt(bundle_id.into(), AttemptMode::WithProgress).await
    }

    /// Cancels any work for the bundle and asks the client to delete it.
    ///
    /// Removing a bundle that has no session or is already removed is a
    /// no-op. A client that reports the bundle as unknown counts as a
    /// successful removal.
    pub async fn remove_bundle(&self, bundle_id: impl Into<BundleId>) -> DownloadState {
        let bundle_id = bundle_id.into();
        let session = self.sessions.lock().await.get(&bundle_id).cloned();
        let Some(session) = session else {
            debug!(bundle = %bundle_id, "no session, nothing to remove");
            return DownloadState::Removed;
        };
        let mut session = session.lock().await;

        if session.state() == &DownloadState::Removed {
            debug!(bundle = %bundle_id, "already removed");
            return DownloadState::Removed;
        }

        for handle in session.cancel_tasks() {
            let _ = handle.await;
        }

        info!(bundle = %bundle_id, "removing bundle");
        let state = match self.client.remove(&bundle_id).await {
            Ok(()) | Err(ClientError::NotFound(_)) => session.mark_removed(),
            Err(e) => {
                warn!(bundle = %bundle_id, "removal failed: {}", e);
                session.fail_removal(e.into_failure(FailurePhase::Removal))
            }
        };
        self.observers.publish(&bundle_id, &state);
        state
    }

    pub async fn state(&self, bundle_id: &BundleId) -> Option<DownloadState> {
        let session = self.sessions.lock().await.get(bundle_id).cloned()?;
        let session = session.lock().await;
        Some(session.state().clone())
    }

    pub async fn snapshot(&self, bundle_id: &BundleId) -> Option<SessionSnapshot> {
        let session = self.sessions.lock().await.get(bundle_id).cloned()?;
        let session = session.lock().await;
        Some(session.snapshot())
    }

    /// Content of a finished bundle.
    pub async fn content(&self, bundle_id: &BundleId) -> Option<Arc<[u8]>> {
        let session = self.sessions.lock().await.get(bundle_id).cloned()?;
        let session = session.lock().await;
        session.content()
    }

    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let sessions: Vec<SharedSession> = self.sessions.lock().await.values().cloned().collect();
        let mut result = Vec::with_capacity(sessions.len());
        for session in sessions {
            result.push(session.lock().await.snapshot());
        }
        result.sort_by(|a, b| a.bundle_id.cmp(&b.bundle_id));
        result
    }

    /// Cancels every attempt and subscription, waits for their tasks and drops
    /// all observers.
    pub async fn shutdown(&self) {
        let sessions: Vec<SharedSession> = self.sessions.lock().await.values().cloned().collect();
        let mut handles = Vec::new();
        for session in sessions {
            handles.extend(session.lock().await.cancel_tasks());
        }
        let count = handles.len();
        for handle in handles {
            let _ = handle.await;
        }
        self.observers.clear();
        info!("Manager: stopped {} bundle task(s).", count);
    }

    async fn session_for(&self, bundle_id: &BundleId) -> SharedSession {
        let mut sessions = self.sessions.lock().await;
        sessions
            .entry(bundle_id.clone())
            .or_insert_with(|| {
                let policy = self
                    .catalog
                    .get(bundle_id)
                    .map_or(DownloadPolicy::default(), |spec| spec.policy);
                Arc::new(Mutex::new(DownloadSession::new(bundle_id.clone(), policy)))
            })
            .clone()
    }

    async fn start_attempt(self: &Arc<Self>, bundle_id: BundleId, mode: AttemptMode) -> StateStream {
        let shared = self.session_for(&bundle_id).await;
        let mut session = shared.lock().await;

        // Subscribed while holding the session lock, so no transition of the
        // attempt we start or join can be missed.
        let stream = self.observers.stream(bundle_id.clone());
        if session.is_busy() {
            debug!(bundle = %bundle_id, op = mode.as_str(), "joining attempt in flight");
            return stream;
        }

        let restarted = session.state() != &DownloadState::Idle;
        let (attempt, token, stale) = session.begin_attempt();
        if restarted {
            self.observers.publish(&bundle_id, session.state());
        }
        let span = info_span!(
            "bundle_op",
            bundle = %bundle_id,
            policy = session.policy().as_str(),
            op = mode.as_str(),
            attempt
        );
        let this = Arc::clone(self);
        let task_session = Arc::clone(&shared);
        let handle = tokio::spawn(
            async move {
                for handle in stale {
                    let _ = handle.await;
                }
                this.run_attempt(task_session, bundle_id, attempt, token, mode)
                    .await;
            }
            .instrument(span),
        );
        session.set_attempt_handle(attempt, handle);
        stream
    }

    async fn run_attempt(
        self: Arc<Self>,
        session: SharedSession,
        bundle_id: BundleId,
        attempt: u64,
        token: CancellationToken,
        mode: AttemptMode,
    ) {
        if !self.advance(&session, attempt, DownloadState::Checking).await {
            return;
        }
        debug!("fetching metadata");
        let metadata = match until_cancelled(&token, self.client.fetch_metadata(&bundle_id)).await {
            None => return,
            Some(Ok(metadata)) => metadata,
            Some(Err(e)) => {
                return self
                    .fail(&session, attempt, e.into_failure(FailurePhase::Metadata))
                    .await;
            }
        };

        if !self
            .advance(&session, attempt, DownloadState::EnsuringAvailability)
            .await
        {
            return;
        }
        if mode == AttemptMode::WithProgress
            && !self.open_subscription(&session, &bundle_id, attempt).await
        {
            return;
        }

        debug!("ensuring local availability");
        match until_cancelled(&token, self.client.ensure_local_availability(&metadata)).await {
            None => return,
            Some(Ok(())) => {}
            Some(Err(e)) => {
                return self
                    .fail(&session, attempt, e.into_failure(FailurePhase::Availability))
                    .await;
            }
        }

        let path = match self.content_path(&metadata) {
            Some(path) => path,
            None => {
                let detail = FailureDetail::new(
                    FailurePhase::Content,
                    FailureKind::StorageFailure,
                    format!("no content path known for bundle '{}'", bundle_id),
                );
                return self.fail(&session, attempt, detail).await;
            }
        };
        debug!(path = %path, "reading content");
        let content = match until_cancelled(&token, self.client.read_content(&path)).await {
            None => return,
            Some(Ok(content)) => content,
            Some(Err(e)) => {
                return self
                    .fail(&session, attempt, e.into_failure(FailurePhase::Content))
                    .await;
            }
        };
        if let Err(e) = verify_content(&content, &self.expectation(&bundle_id)) {
            let detail = FailureDetail::new(
                FailurePhase::Content,
                FailureKind::ContentDecodeFailure,
                e.to_string(),
            );
            return self.fail(&session, attempt, detail).await;
        }

        let len = content.len();
        let mut guard = session.lock().await;
        if let Some(state) = guard.complete(attempt, content) {
            info!(bytes = len, "bundle ready");
            self.observers.publish(&bundle_id, &state);
        }
    }

    async fn advance(&self, session: &SharedSession, attempt: u64, state: DownloadState) -> bool {
        let mut session = session.lock().await;
        match session.advance(attempt, state) {
            Some(state) => {
                self.observers.publish(session.bundle_id(), &state);
                true
            }
            None => false,
        }
    }

    async fn fail(&self, session: &SharedSession, attempt: u64, detail: FailureDetail) {
        let mut session = session.lock().await;
        if let Some(state) = session.fail(attempt, detail) {
            if let Some(detail) = state.failure() {
                error!(kind = ?detail.kind, "{}", detail);
            }
            self.observers.publish(session.bundle_id(), &state);
        }
    }

    /// Spawns the task relaying transfer notifications for `attempt`.
    async fn open_subscription(&self, session: &SharedSession, bundle_id: &BundleId, attempt: u64) -> bool {
        let mut guard = session.lock().await;
        if !guard.is_current(attempt) {
            return false;
        }
        let events = self.client.status_updates(bundle_id);
        let token = CancellationToken::new();
        let handle = tokio::spawn(
            relay_status(
                Arc::clone(session),
                self.observers.clone(),
                attempt,
                events,
                token.clone(),
            )
            .in_current_span(),
        );
        if guard.set_subscription(token, handle).is_some() {
            debug!("replaced previous status subscription");
        }
        true
    }

    fn content_path(&self, metadata: &BundleMetadata) -> Option<String> {
        self.catalog
            .get(&metadata.id)
            .and_then(|spec| spec.content_path.clone())
            .or_else(|| metadata.content_path.clone())
    }

    fn expectation(&self, bundle_id: &BundleId) -> ContentExpectation {
        self.catalog
            .get(bundle_id)
            .map(BundleSpec::expectation)
            .unwrap_or_default()
    }
}

/// Runs `fut` unless `token` is cancelled first.
async fn until_cancelled<T>(token: &CancellationToken, fut: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Consumes one status subscription until it closes or is cancelled.
async fn relay_status(
    session: SharedSession,
    observers: ObserverRegistry,
    attempt: u64,
    mut events: StatusStream,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            next = events.next() => match next {
                Some(event) => event,
                None => break,
            },
        };
        let mut session = session.lock().await;
        debug!(?event, "status update");
        if let Some(state) = session.apply_status(attempt, &event) {
            observers.publish(session.bundle_id(), &state);
        }
        if event.is_terminal() {
            break;
        }
    }
    debug!("status subscription closed");
}
