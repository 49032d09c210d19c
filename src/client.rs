//! Contract to the external distribution subsystem that owns bundle storage
//! and transfers.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::models::{BundleId, BundleMetadata, FailureDetail, FailureKind, FailurePhase, StatusEvent};

/// Errors reported by a [`BundleClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("bundle not found: {0}")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Classifies the error for the step it interrupted.
    pub fn kind_in(&self, phase: FailurePhase) -> FailureKind {
        match (phase, self) {
            (FailurePhase::Removal, _) => FailureKind::RemovalFailure,
            (_, ClientError::Network(_)) => FailureKind::NetworkFailure,
            (FailurePhase::Metadata, ClientError::NotFound(_)) => FailureKind::MetadataNotFound,
            _ => FailureKind::StorageFailure,
        }
    }

    pub fn into_failure(self, phase: FailurePhase) -> FailureDetail {
        FailureDetail::new(phase, self.kind_in(phase), self.to_string())
    }
}

/// Lazy sequence of transfer notifications for one bundle. It ends after a
/// terminal event.
pub type StatusStream = BoxStream<'static, StatusEvent>;

#[async_trait]
pub trait BundleClient: Send + Sync + 'static {
    async fn fetch_metadata(&self, id: &BundleId) -> Result<BundleMetadata, ClientError>;

    /// Resolves once the bundle is present on local storage, transferring it
    /// first if needed.
    async fn ensure_local_availability(&self, metadata: &BundleMetadata) -> Result<(), ClientError>;

    async fn read_content(&self, path: &str) -> Result<Vec<u8>, ClientError>;

    /// Opens a new subscription to transfer notifications for `id`.
    fn status_updates(&self, id: &BundleId) -> StatusStream;

    async fn remove(&self, id: &BundleId) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_depends_on_phase() {
        let not_found = ClientError::NotFound("Essential".into());
        assert_eq!(not_found.kind_in(FailurePhase::Metadata), FailureKind::MetadataNotFound);
        assert_eq!(not_found.kind_in(FailurePhase::Content), FailureKind::StorageFailure);
        assert_eq!(not_found.kind_in(FailurePhase::Removal), FailureKind::RemovalFailure);

        let offline = ClientError::Network("offline".into());
        assert_eq!(offline.kind_in(FailurePhase::Availability), FailureKind::NetworkFailure);
    }

    #[test]
    fn failure_keeps_phase_and_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read only");
        let detail = ClientError::from(io).into_failure(FailurePhase::Removal);
        assert_eq!(detail.phase, FailurePhase::Removal);
        assert_eq!(detail.kind, FailureKind::RemovalFailure);
        assert_eq!(detail.to_string(), "removal failed: io error: read only");
    }
}
