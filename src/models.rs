// src/models.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Opaque identifier of a named asset bundle, e.g. `"Essential"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(String);

impl BundleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BundleId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for BundleId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&BundleId> for BundleId {
    fn from(id: &BundleId) -> Self {
        id.clone()
    }
}

/// Usage pattern of a bundle. The orchestration treats all three the same way;
/// the policy is a label carried for callers and logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPolicy {
    /// Fetched before first launch.
    Essential,
    /// Fetched in the background after install.
    Prefetch,
    /// Fetched when the user asks for it.
    #[default]
    OnDemand,
}

impl DownloadPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadPolicy::Essential => "essential",
            DownloadPolicy::Prefetch => "prefetch",
            DownloadPolicy::OnDemand => "on_demand",
        }
    }
}

/// What the distribution subsystem knows about a bundle before it is local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub id: BundleId,
    /// Path of the primary content file, relative to the local bundle store.
    #[serde(default)]
    pub content_path: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl BundleMetadata {
    pub fn new(id: impl Into<BundleId>) -> Self {
        Self {
            id: id.into(),
            content_path: None,
            size_bytes: None,
        }
    }

    pub fn with_content_path(mut self, path: impl Into<String>) -> Self {
        self.content_path = Some(path.into());
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }
}

/// Raw transfer notification emitted by the distribution subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StatusEvent {
    Began,
    Paused,
    Downloading(f64),
    Finished,
    Failed(String),
}

impl StatusEvent {
    /// The status stream closes after a terminal event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StatusEvent::Finished | StatusEvent::Failed(_))
    }
}

/// The step of an operation at which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Metadata,
    Availability,
    Content,
    Removal,
}

impl FailurePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePhase::Metadata => "metadata",
            FailurePhase::Availability => "availability",
            FailurePhase::Content => "content read",
            FailurePhase::Removal => "removal",
        }
    }
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing failure classes. None of them is fatal to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    #[error("metadata not found")]
    MetadataNotFound,
    #[error("network failure")]
    NetworkFailure,
    #[error("storage failure")]
    StorageFailure,
    #[error("content decode failure")]
    ContentDecodeFailure,
    #[error("removal failure")]
    RemovalFailure,
}

/// Payload of [`DownloadState::Failed`]: which step failed, how, and the cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{phase} failed: {message}")]
pub struct FailureDetail {
    pub phase: FailurePhase,
    pub kind: FailureKind,
    pub message: String,
}

impl FailureDetail {
    pub fn new(phase: FailurePhase, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            phase,
            kind,
            message: message.into(),
        }
    }
}

/// Caller-facing state of a bundle session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DownloadState {
    Idle,
    Checking,
    EnsuringAvailability,
    Downloading(f64),
    Paused,
    Finished,
    Failed(FailureDetail),
    Removed,
}

impl DownloadState {
    /// Terminal for the current attempt. A new operation restarts the session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Finished | DownloadState::Failed(_) | DownloadState::Removed
        )
    }

    /// Whether transfer notifications may still move the session.
    pub fn accepts_status(&self) -> bool {
        matches!(
            self,
            DownloadState::EnsuringAvailability | DownloadState::Downloading(_) | DownloadState::Paused
        )
    }

    pub fn failure(&self) -> Option<&FailureDetail> {
        match self {
            DownloadState::Failed(detail) => Some(detail),
            _ => None,
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadState::Idle => f.write_str("Not loaded"),
            DownloadState::Checking => f.write_str("Checking..."),
            DownloadState::EnsuringAvailability => f.write_str("Ensuring availability..."),
            DownloadState::Downloading(fraction) => {
                write!(f, "Downloading: {}%", (fraction * 100.0).floor() as u32)
            }
            DownloadState::Paused => f.write_str("Download paused"),
            DownloadState::Finished => f.write_str("Downloaded and loaded"),
            DownloadState::Failed(detail) => write!(f, "Error: {}", detail),
            DownloadState::Removed => f.write_str("Asset removed"),
        }
    }
}

/// Point-in-time view of a session, safe to hand out to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub bundle_id: BundleId,
    pub policy: DownloadPolicy,
    pub state: DownloadState,
    /// Transfer progress as a fraction from 0.0 to 1.0.
    pub progress: f64,
    /// Length of the stored content, present only once finished.
    pub content_len: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines_match_state() {
        assert_eq!(DownloadState::Idle.to_string(), "Not loaded");
        assert_eq!(DownloadState::Downloading(0.3).to_string(), "Downloading: 30%");
        assert_eq!(DownloadState::Downloading(1.0).to_string(), "Downloading: 100%");
        assert_eq!(DownloadState::Removed.to_string(), "Asset removed");

        let failed = DownloadState::Failed(FailureDetail::new(
            FailurePhase::Metadata,
            FailureKind::MetadataNotFound,
            "bundle not found: Missing",
        ));
        assert_eq!(
            failed.to_string(),
            "Error: metadata failed: bundle not found: Missing"
        );
    }

    #[test]
    fn terminal_states() {
        assert!(DownloadState::Finished.is_terminal());
        assert!(DownloadState::Removed.is_terminal());
        assert!(!DownloadState::Paused.is_terminal());
        assert!(!DownloadState::Checking.accepts_status());
        assert!(DownloadState::Paused.accepts_status());
    }

    #[test]
    fn policy_deserializes_snake_case() {
        let policy: DownloadPolicy = serde_json::from_str("\"on_demand\"").unwrap();
        assert_eq!(policy, DownloadPolicy::OnDemand);
        let id: BundleId = serde_json::from_str("\"Essential\"").unwrap();
        assert_eq!(id, BundleId::from("Essential"));
    }
}
