//! Image reference parsing and the nydus tag-suffix policy.
//!
//! Parses references like `example.com/lib/foo:1.2` into structured
//! components and applies the `_nydus_v2` family suffix that marks an
//! accelerated image tag.

use nydus_commit_core::error::{CommitError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Tag suffix carried by every accelerated image of this family.
pub const NYDUS_REF_SUFFIX: &str = "_nydus_v2";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "docker.io", "example.com:5000")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "lib/foo")
    pub repository: String,
    /// Tag (e.g., "latest", "1.2_nydus_v2")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `myuser/myimage:v1` → docker.io/myuser/myimage:v1
    /// - `example.com:5000/org/image:tag`
    /// - `example.com/org/image@sha256:abc...`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(CommitError::InvalidImageReference(
                "empty image reference".to_string(),
            ));
        }

        // Split off the digest first (@ separator)
        let (name_tag, digest) = if let Some(at_pos) = reference.rfind('@') {
            let digest_part = &reference[at_pos + 1..];
            if !digest_part.contains(':') {
                return Err(CommitError::InvalidImageReference(format!(
                    "invalid digest in '{}': expected algorithm:hex",
                    reference
                )));
            }
            (&reference[..at_pos], Some(digest_part.to_string()))
        } else {
            (reference, None)
        };

        // Split the tag: last colon after the last slash
        let (name, tag) = if let Some(slash_pos) = name_tag.rfind('/') {
            let after_slash = &name_tag[slash_pos + 1..];
            if let Some(colon_pos) = after_slash.rfind(':') {
                let tag = &after_slash[colon_pos + 1..];
                (
                    name_tag[..slash_pos + 1 + colon_pos].to_string(),
                    Some(tag.to_string()),
                )
            } else {
                (name_tag.to_string(), None)
            }
        } else if let Some(colon_pos) = name_tag.rfind(':') {
            // Could be registry:port or name:tag; digits after the colon
            // mean a port and the whole string is a name
            let after_colon = &name_tag[colon_pos + 1..];
            if after_colon.chars().all(|c| c.is_ascii_digit()) {
                (name_tag.to_string(), None)
            } else {
                (
                    name_tag[..colon_pos].to_string(),
                    Some(after_colon.to_string()),
                )
            }
        } else {
            (name_tag.to_string(), None)
        };

        let (registry, repository) = Self::split_registry_repository(&name)?;

        // Apply the default tag if neither tag nor digest is present
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        if let Some(slash_pos) = name.find('/') {
            let first = &name[..slash_pos];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                let repo = name[slash_pos + 1..].to_string();
                if repo.is_empty() {
                    return Err(CommitError::InvalidImageReference(format!(
                        "empty repository in '{}'",
                        name
                    )));
                }
                return Ok((first.to_string(), repo));
            }
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Append the nydus suffix to `reference`, idempotently.
///
/// Digest-pinned references are rejected; a missing tag normalizes to
/// `latest` before suffixing. A reference whose tag already ends with the
/// suffix is returned unchanged.
pub fn append_nydus_suffix(reference: &str) -> Result<String> {
    let parsed = ImageReference::parse(reference)?;
    if parsed.digest.is_some() {
        return Err(CommitError::InvalidImageReference(format!(
            "unsupported digested image reference: {}",
            reference
        )));
    }

    let full = parsed.full_reference();
    if full.ends_with(NYDUS_REF_SUFFIX) {
        return Ok(reference.to_string());
    }
    Ok(format!("{}{}", full, NYDUS_REF_SUFFIX))
}

/// Whether `reference` already carries the nydus suffix.
///
/// Digest-pinned references are rejected, matching [`append_nydus_suffix`].
pub fn has_nydus_suffix(reference: &str) -> Result<bool> {
    let parsed = ImageReference::parse(reference)?;
    if parsed.digest.is_some() {
        return Err(CommitError::InvalidImageReference(format!(
            "unsupported digested image reference: {}",
            reference
        )));
    }
    Ok(parsed.full_reference().ends_with(NYDUS_REF_SUFFIX))
}
