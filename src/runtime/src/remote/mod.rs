//! Registry remote built on `oci-distribution`.
//!
//! Wraps a registry client for one reference with basic-auth credentials
//! and the plaintext-downgrade dance: every operation is attempted over
//! TLS first, and when the server turns out not to speak it, the client is
//! rebuilt for plain HTTP and the operation retried once. The downgrade
//! sticks for the lifetime of the `Remote`.
//!
//! A `Remote` is not concurrency-safe (the downgrade mutates the client);
//! each pushing task constructs its own from the shared credentials.

pub mod retry;

use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciImageManifest, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Reference, RegistryOperation};

use nydus_commit_core::error::{CommitError, Result};

use crate::util::error_chain;
use retry::retryable_with_http;

/// Registry credentials shared by every `Remote` of a commit.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    fn to_auth(&self) -> RegistryAuth {
        if self.username.is_empty() {
            RegistryAuth::Anonymous
        } else {
            RegistryAuth::Basic(self.username.clone(), self.password.clone())
        }
    }
}

/// A registry client bound to a single image reference.
pub struct Remote {
    reference: Reference,
    auth: RegistryAuth,
    client: Client,
    plain_http: bool,
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("reference", &self.reference)
            .field("auth", &self.auth)
            .field("plain_http", &self.plain_http)
            .finish_non_exhaustive()
    }
}

impl Remote {
    pub fn new(reference: &str, credentials: &Credentials) -> Result<Self> {
        let reference: Reference = reference.parse().map_err(|e| {
            CommitError::InvalidImageReference(format!("{}: {}", reference, e))
        })?;

        Ok(Self {
            reference,
            auth: credentials.to_auth(),
            client: Self::build_client(ClientProtocol::Https),
            plain_http: false,
        })
    }

    fn build_client(protocol: ClientProtocol) -> Client {
        Client::new(ClientConfig {
            protocol,
            ..Default::default()
        })
    }

    /// The reference this remote talks to.
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    /// Rebuild the client for plain HTTP if `err` is a downgrade signal.
    pub fn maybe_with_http(&mut self, err: &CommitError) {
        if !self.plain_http && retryable_with_http(err) {
            tracing::warn!(reference = %self.reference.whole(), "registry does not speak TLS, falling back to plain HTTP");
            self.plain_http = true;
            self.client = Self::build_client(ClientProtocol::Http);
        }
    }

    /// Pull the manifest (and its digest) for this remote's reference.
    pub async fn pull_manifest(&mut self) -> Result<(OciManifest, String)> {
        let reference = self.reference.clone();
        match self.pull_manifest_for(&reference).await {
            Ok(pulled) => Ok(pulled),
            Err(err) if retryable_with_http(&err) => {
                self.maybe_with_http(&err);
                self.pull_manifest_for(&reference).await
            }
            Err(err) => Err(err),
        }
    }

    /// Pull the manifest of the same repository pinned to `digest`.
    ///
    /// Used to resolve an image index down to the per-platform manifest.
    pub async fn pull_manifest_digest(&mut self, digest: &str) -> Result<(OciManifest, String)> {
        let pinned = Reference::with_digest(
            self.reference.registry().to_string(),
            self.reference.repository().to_string(),
            digest.to_string(),
        );
        match self.pull_manifest_for(&pinned).await {
            Ok(pulled) => Ok(pulled),
            Err(err) if retryable_with_http(&err) => {
                self.maybe_with_http(&err);
                self.pull_manifest_for(&pinned).await
            }
            Err(err) => Err(err),
        }
    }

    async fn pull_manifest_for(&self, reference: &Reference) -> Result<(OciManifest, String)> {
        self.client
            .pull_manifest(reference, &self.auth)
            .await
            .map_err(|e| CommitError::Fetch(format!("pull manifest: {}", error_chain(&e))))
    }

    /// Pull a blob described by `descriptor` into `out`.
    pub async fn pull_blob(&mut self, descriptor: &OciDescriptor, out: &mut Vec<u8>) -> Result<()> {
        match self.pull_blob_inner(descriptor, out).await {
            Ok(()) => Ok(()),
            Err(err) if retryable_with_http(&err) => {
                self.maybe_with_http(&err);
                out.clear();
                self.pull_blob_inner(descriptor, out).await
            }
            Err(err) => Err(err),
        }
    }

    async fn pull_blob_inner(&self, descriptor: &OciDescriptor, out: &mut Vec<u8>) -> Result<()> {
        self.client
            .pull_blob(&self.reference, descriptor, out)
            .await
            .map_err(|e| {
                CommitError::Fetch(format!(
                    "pull blob {}: {}",
                    descriptor.digest,
                    error_chain(&e)
                ))
            })
    }

    /// Push a blob, downgrading to plain HTTP once when signalled.
    pub async fn push_blob(&mut self, data: &[u8], digest: &str) -> Result<()> {
        match self.push_blob_inner(data, digest).await {
            Ok(()) => Ok(()),
            Err(err) if retryable_with_http(&err) => {
                self.maybe_with_http(&err);
                self.push_blob_inner(data, digest).await
            }
            Err(err) => Err(err),
        }
    }

    async fn push_blob_inner(&self, data: &[u8], digest: &str) -> Result<()> {
        let _ = self
            .client
            .auth(&self.reference, &self.auth, RegistryOperation::Push)
            .await
            .map_err(|e| CommitError::Push(format!("authenticate push: {}", error_chain(&e))))?;
        self.client
            .push_blob(&self.reference, data, digest)
            .await
            .map_err(|e| CommitError::Push(format!("push blob {}: {}", digest, error_chain(&e))))?;
        Ok(())
    }

    /// [`Remote::push_blob`] under bounded retry.
    ///
    /// A downgrade-classified error after the plaintext re-attempt is
    /// final, as is cancellation; everything else retries with the fixed
    /// delay.
    pub async fn push_blob_retrying(&mut self, data: &[u8], digest: &str) -> Result<()> {
        let mut remaining = retry::RETRY_ATTEMPTS;
        loop {
            match self.push_blob(data, digest).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    remaining -= 1;
                    if remaining == 0
                        || retryable_with_http(&err)
                        || matches!(err, CommitError::Cancelled)
                    {
                        return Err(err);
                    }
                    tracing::warn!(error = %err, remaining, "retrying blob push");
                    tokio::time::sleep(retry::RETRY_DELAY).await;
                }
            }
        }
    }

    /// Push an image manifest under this remote's tagged reference.
    pub async fn push_manifest(&mut self, manifest: OciImageManifest) -> Result<()> {
        let wrapped = OciManifest::Image(manifest);
        match self.push_manifest_inner(&wrapped).await {
            Ok(()) => Ok(()),
            Err(err) if retryable_with_http(&err) => {
                self.maybe_with_http(&err);
                self.push_manifest_inner(&wrapped).await
            }
            Err(err) => Err(err),
        }
    }

    async fn push_manifest_inner(&self, manifest: &OciManifest) -> Result<()> {
        let _ = self
            .client
            .auth(&self.reference, &self.auth, RegistryOperation::Push)
            .await
            .map_err(|e| CommitError::Push(format!("authenticate push: {}", error_chain(&e))))?;
        self.client
            .push_manifest(&self.reference, manifest)
            .await
            .map_err(|e| CommitError::Push(format!("push manifest: {}", error_chain(&e))))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_anonymous() {
        let credentials = Credentials::default();
        assert!(matches!(credentials.to_auth(), RegistryAuth::Anonymous));
    }

    #[test]
    fn test_credentials_basic() {
        let credentials = Credentials {
            username: "bob".to_string(),
            password: "pw".to_string(),
        };
        assert!(matches!(credentials.to_auth(), RegistryAuth::Basic(_, _)));
    }

    #[test]
    fn test_new_rejects_garbage_reference() {
        let err = Remote::new(":::", &Credentials::default()).unwrap_err();
        assert!(matches!(err, CommitError::InvalidImageReference(_)));
    }

    #[test]
    fn test_downgrade_is_sticky_and_classified() {
        let mut remote =
            Remote::new("example.com/lib/foo:1.2_nydus_v2", &Credentials::default()).unwrap();
        assert!(!remote.plain_http);

        let unrelated = CommitError::Push("blob upload invalid".to_string());
        remote.maybe_with_http(&unrelated);
        assert!(!remote.plain_http);

        let downgrade = CommitError::Push(
            "http: server gave HTTP response to HTTPS client".to_string(),
        );
        remote.maybe_with_http(&downgrade);
        assert!(remote.plain_http);
    }
}
