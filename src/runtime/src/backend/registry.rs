//! Registry blob backend.

use std::path::Path;

use async_trait::async_trait;
use oci_distribution::manifest::OciDescriptor;

use nydus_commit_core::error::{CommitError, Result};

use crate::remote::{Credentials, Remote};

use super::Backend;

/// Pushes blobs to the distribution registry.
pub struct RegistryBackend {
    reference: String,
    credentials: Credentials,
}

impl RegistryBackend {
    pub fn new(reference: &str, credentials: Credentials) -> Self {
        Self {
            reference: reference.to_string(),
            credentials,
        }
    }
}

#[async_trait]
impl Backend for RegistryBackend {
    async fn push(&self, blob: &Path, descriptor: &OciDescriptor) -> Result<()> {
        // The plaintext downgrade mutates the client, so every push owns a
        // fresh remote instead of sharing one across tasks.
        let mut remote = Remote::new(&self.reference, &self.credentials)?;
        let data = tokio::fs::read(blob)
            .await
            .map_err(|e| CommitError::Push(format!("read {}: {}", blob.display(), e)))?;

        remote.push_blob_retrying(&data, &descriptor.digest).await
    }

    fn external(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_backend_is_not_external() {
        let backend = RegistryBackend::new(
            "example.com/lib/foo:1.2_nydus_v2",
            Credentials::default(),
        );
        assert!(!backend.external());
    }
}
