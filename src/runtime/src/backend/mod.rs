//! Blob publication backends.
//!
//! Blobs land either in the distribution registry or in an object store.
//! The two variants share one trait; the `external` flag tells the manifest
//! builder whether blobs live outside the registry and must therefore be
//! referenced by annotation instead of as manifest layers.

pub mod oss;
pub mod registry;

use std::path::Path;

use async_trait::async_trait;
use oci_distribution::manifest::OciDescriptor;

use nydus_commit_core::config::Config;
use nydus_commit_core::error::Result;

use crate::remote::Credentials;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Publish the blob file described by `descriptor`.
    async fn push(&self, blob: &Path, descriptor: &OciDescriptor) -> Result<()>;

    /// Whether blobs live outside the image registry.
    fn external(&self) -> bool;
}

/// Construct the backend selected by the configuration: the object store
/// when an OSS endpoint is configured, the registry otherwise.
pub fn from_config(config: &Config, target: &str) -> Result<Box<dyn Backend>> {
    if config.uses_object_store() {
        Ok(Box::new(oss::OssBackend::new(&config.oss, false)?))
    } else {
        let credentials = Credentials {
            username: config.distribution.username.clone(),
            password: config.distribution.password.clone(),
        };
        Ok(Box::new(registry::RegistryBackend::new(target, credentials)))
    }
}
