//! Orchestrates retrieval of named asset bundles: per-bundle sessions, a
//! caller-facing state machine, live progress relay and bundle removal.

pub mod client;
pub mod config;
pub mod fs_client;
pub mod integrity;
pub mod limiter;
pub mod manager;
pub mod models;
pub mod observer;
pub mod session;
pub mod status_mapper;
pub mod testing;

/// Convenient re-exports of the common types.
pub mod prelude {
    pub use crate::client::{BundleClient, ClientError, StatusStream};
    pub use crate::config::{load_config, validate_config, BundleSpec, ManagerConfig, StoreConfig};
    pub use crate::fs_client::FsBundleClient;
    pub use crate::manager::OrchestrationManager;
    pub use crate::models::{
        BundleId, BundleMetadata, DownloadPolicy, DownloadState, FailureDetail, FailureKind,
        FailurePhase, SessionSnapshot, StatusEvent,
    };
    pub use crate::observer::{ObserverHandle, StateStream};
}
