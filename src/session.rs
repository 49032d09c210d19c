// src/session.rs

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::models::{
    BundleId, DownloadPolicy, DownloadState, FailureDetail, SessionSnapshot, StatusEvent,
};
use crate::status_mapper::StatusMapper;

/// A spawned task together with the token that stops it.
#[derive(Debug)]
pub(crate) struct TaskSlot {
    pub token: CancellationToken,
    pub handle: Option<JoinHandle<()>>,
}

impl TaskSlot {
    fn new(token: CancellationToken) -> Self {
        Self { token, handle: None }
    }

    /// Cancels the task and hands back its handle so the caller can await it
    /// once no lock is held.
    fn cancel(mut self) -> Option<JoinHandle<()>> {
        self.token.cancel();
        let handle = self.handle.take();
        if let Some(handle) = &handle {
            handle.abort();
        }
        handle
    }
}

/// State of one bundle, owned by the orchestration manager.
#[derive(Debug)]
pub struct DownloadSession {
    bundle_id: BundleId,
    policy: DownloadPolicy,
    state: DownloadState,
    progress: f64,
    content: Option<Arc<[u8]>>,
    /// Number of the most recently started attempt.
    attempt_seq: u64,
    /// The operation task of the attempt still in flight, if any.
    attempt: Option<TaskSlot>,
    /// At most one live status subscription.
    subscription: Option<TaskSlot>,
}

impl DownloadSession {
    pub fn new(bundle_id: BundleId, policy: DownloadPolicy) -> Self {
        Self {
            bundle_id,
            policy,
            state: DownloadState::Idle,
            progress: 0.0,
            content: None,
            attempt_seq: 0,
            attempt: None,
            subscription: None,
        }
    }

    pub fn bundle_id(&self) -> &BundleId {
        &self.bundle_id
    }

    pub fn policy(&self) -> DownloadPolicy {
        self.policy
    }

    pub fn state(&self) -> &DownloadState {
        &self.state
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn content(&self) -> Option<Arc<[u8]>> {
        self.content.clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            bundle_id: self.bundle_id.clone(),
            policy: self.policy,
            state: self.state.clone(),
            progress: self.progress,
            content_len: self.content.as_ref().map(|c| c.len()),
        }
    }

    /// An attempt is in flight.
    pub fn is_busy(&self) -> bool {
        self.attempt.is_some()
    }

    #[cfg(test)]
    fn has_subscription(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn is_current(&self, attempt: u64) -> bool {
        self.attempt_seq == attempt && self.attempt.is_some()
    }

    /// Resets the session to `Idle` for a fresh attempt and returns the attempt
    /// number with its cancellation token, plus the handles of any tasks left
    /// over from the previous attempt. The caller publishes the reset when the
    /// session was not already idle.
    pub(crate) fn begin_attempt(&mut self) -> (u64, CancellationToken, Vec<JoinHandle<()>>) {
        let stale = self.cancel_tasks();
        self.attempt_seq += 1;
        self.state = DownloadState::Idle;
        self.progress = 0.0;
        self.content = None;

        let token = CancellationToken::new();
        self.attempt = Some(TaskSlot::new(token.clone()));
        (self.attempt_seq, token, stale)
    }

    pub(crate) fn set_attempt_handle(&mut self, attempt: u64, handle: JoinHandle<()>) {
        match self.attempt.as_mut() {
            Some(slot) if self.attempt_seq == attempt => slot.handle = Some(handle),
            _ => handle.abort(),
        }
    }

    /// Attaches the status subscription of `attempt`, replacing any previous
    /// one. Returns the replaced task's handle.
    pub(crate) fn set_subscription(
        &mut self,
        token: CancellationToken,
        handle: JoinHandle<()>,
    ) -> Option<JoinHandle<()>> {
        let previous = self.subscription.take().and_then(TaskSlot::cancel);
        self.subscription = Some(TaskSlot {
            token,
            handle: Some(handle),
        });
        previous
    }

    /// Cancels the in-flight attempt and the status subscription.
    pub(crate) fn cancel_tasks(&mut self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        if let Some(handle) = self.attempt.take().and_then(TaskSlot::cancel) {
            handles.push(handle);
        }
        if let Some(handle) = self.subscription.take().and_then(TaskSlot::cancel) {
            handles.push(handle);
        }
        handles
    }

    /// Moves to a non-terminal phase of the current attempt.
    pub(crate) fn advance(&mut self, attempt: u64, state: DownloadState) -> Option<DownloadState> {
        if !self.is_current(attempt) {
            return None;
        }
        self.state = state.clone();
        Some(state)
    }

    /// Commits fully read content and ends the attempt.
    pub(crate) fn complete(&mut self, attempt: u64, content: Vec<u8>) -> Option<DownloadState> {
        if !self.is_current(attempt) {
            return None;
        }
        self.attempt = None;
        self.content = Some(content.into());
        self.progress = 1.0;
        self.state = DownloadState::Finished;
        Some(DownloadState::Finished)
    }

    /// Ends the current attempt with `detail`.
    pub(crate) fn fail(&mut self, attempt: u64, detail: FailureDetail) -> Option<DownloadState> {
        if !self.is_current(attempt) {
            return None;
        }
        self.attempt = None;
        self.state = DownloadState::Failed(detail);
        Some(self.state.clone())
    }

    /// Records a failed removal. Stored content is kept.
    pub(crate) fn fail_removal(&mut self, detail: FailureDetail) -> DownloadState {
        self.state = DownloadState::Failed(detail);
        self.state.clone()
    }

    pub(crate) fn mark_removed(&mut self) -> DownloadState {
        self.content = None;
        self.progress = 0.0;
        self.state = DownloadState::Removed;
        DownloadState::Removed
    }

    /// Applies a transfer notification received by the subscription of
    /// `attempt`. Returns the state to publish, if it changed.
    pub(crate) fn apply_status(&mut self, attempt: u64, event: &StatusEvent) -> Option<DownloadState> {
        if self.attempt_seq != attempt {
            return None;
        }
        let transition = StatusMapper::map(event, self.progress);
        if transition.advisory {
            debug!(bundle = %self.bundle_id, ?event, "transfer reported completion");
            return None;
        }
        if !self.state.accepts_status() || transition.state == self.state {
            return None;
        }
        if let Some(progress) = transition.progress {
            self.progress = progress;
        }
        self.state = transition.state;
        Some(self.state.clone())
    }
}
