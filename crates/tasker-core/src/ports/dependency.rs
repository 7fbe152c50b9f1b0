//! Dependency port - リース可能なリソースの提供者
//!
//! Sessions, stores and pools all implement this; a DataApi only ever sees
//! `Arc<dyn Dependency>`.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{LeaseHandle, TaskerError};

/// A provider of [`LeaseHandle`]s.
///
/// # Contract
/// - `request_resource` fails with [`TaskerError::Timeout`] when it cannot be
///   satisfied within `timeout`.
/// - Every caller gets its own handle. Serializing access to a resource that
///   cannot be shared is the provider's job.
#[async_trait]
pub trait Dependency: Send + Sync {
    /// Timeout used when the caller does not specify one.
    fn default_timeout(&self) -> Duration;

    async fn request_resource(&self, timeout: Duration) -> Result<LeaseHandle, TaskerError>;
}
