//! Object-store (OSS) blob backend.
//!
//! Objects are keyed `<prefix><digest-hex>`. Uploads go through the
//! multipart protocol: split into fixed-size chunks (at most 9999 parts),
//! initiate, upload the parts in parallel with retry, complete; any part
//! failure aborts the upload to release the partial state on the server.
//! Requests carry OSS v1 signatures (HMAC-SHA1 over verb, date and the
//! canonicalized resource).

use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use oci_distribution::manifest::OciDescriptor;
use reqwest::header;
use ring::hmac;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use nydus_commit_core::config::OssConfig;
use nydus_commit_core::error::{CommitError, Result};

use crate::remote::retry::{with_retry, RETRY_ATTEMPTS};
use crate::util::error_chain;

use super::Backend;

/// Fixed multipart chunk size.
pub const MULTIPART_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// One multipart chunk of the blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk {
    number: usize,
    offset: u64,
    size: u64,
}

/// A part that finished uploading.
#[derive(Debug, Clone)]
struct UploadedPart {
    number: usize,
    etag: String,
}

/// Split `[0, blob_size)` into fixed-size chunks, failing beyond 9999 parts.
fn split_chunks(blob_size: u64, chunk_size: u64) -> Result<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(CommitError::Push("invalid chunk size".to_string()));
    }
    let full = blob_size / chunk_size;
    if full >= 10_000 {
        return Err(CommitError::Push(
            "too many parts, please increase chunk size".to_string(),
        ));
    }

    let mut chunks = Vec::with_capacity(full as usize + 1);
    for i in 0..full {
        chunks.push(Chunk {
            number: i as usize + 1,
            offset: i * chunk_size,
            size: chunk_size,
        });
    }
    let rest = blob_size % chunk_size;
    if rest > 0 {
        chunks.push(Chunk {
            number: chunks.len() + 1,
            offset: full * chunk_size,
            size: rest,
        });
    }
    Ok(chunks)
}

/// Extract the text of the first `<tag>…</tag>` element.
fn xml_text<'a>(body: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(&body[start..end])
}

/// Body of a CompleteMultipartUpload request, parts in number order.
fn complete_body(parts: &[UploadedPart]) -> String {
    let mut sorted: Vec<&UploadedPart> = parts.iter().collect();
    sorted.sort_by_key(|part| part.number);

    let mut xml = String::from("<CompleteMultipartUpload>");
    for part in sorted {
        xml.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
            part.number, part.etag
        ));
    }
    xml.push_str("</CompleteMultipartUpload>");
    xml
}

/// Pushes blobs to an OSS bucket.
#[derive(Debug)]
pub struct OssBackend {
    client: reqwest::Client,
    scheme: String,
    host: String,
    bucket: String,
    access_key_id: String,
    access_key_secret: String,
    // OSS storage has no directories; the prefix makes objects path-like.
    object_prefix: String,
    force_push: bool,
}

impl OssBackend {
    pub fn new(config: &OssConfig, force_push: bool) -> Result<Self> {
        if config.endpoint.is_empty() || config.bucket_name.is_empty() {
            return Err(CommitError::Config(
                "oss `endpoint` and `bucket_name` fields are required".to_string(),
            ));
        }

        let (scheme, host) = match config.endpoint.split_once("://") {
            Some((scheme, host)) => (scheme.to_string(), host.to_string()),
            None => ("https".to_string(), config.endpoint.clone()),
        };

        Ok(Self {
            client: reqwest::Client::new(),
            scheme,
            host,
            bucket: config.bucket_name.clone(),
            access_key_id: config.access_key_id.clone(),
            access_key_secret: config.access_key_secret.clone(),
            object_prefix: config.object_prefix.clone(),
            force_push,
        })
    }

    fn object_url(&self, key: &str, query: &str) -> String {
        format!(
            "{}://{}.{}/{}{}",
            self.scheme, self.bucket, self.host, key, query
        )
    }

    fn sign(&self, string_to_sign: &str) -> String {
        let key = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            self.access_key_secret.as_bytes(),
        );
        let tag = hmac::sign(&key, string_to_sign.as_bytes());
        BASE64.encode(tag.as_ref())
    }

    fn authorization(&self, verb: &str, content_type: &str, date: &str, resource: &str) -> String {
        let string_to_sign = format!("{}\n\n{}\n{}\n{}", verb, content_type, date, resource);
        format!("OSS {}:{}", self.access_key_id, self.sign(&string_to_sign))
    }

    fn date_header() -> String {
        chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string()
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let resource = format!("/{}/{}", self.bucket, key);
        let date = Self::date_header();
        let response = self
            .client
            .head(self.object_url(key, ""))
            .header(header::DATE, &date)
            .header(
                header::AUTHORIZATION,
                self.authorization("HEAD", "", &date, &resource),
            )
            .send()
            .await
            .map_err(|e| CommitError::Push(format!("check object existence: {}", error_chain(&e))))?;

        match response.status() {
            status if status.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            status => Err(CommitError::Push(format!(
                "check object existence: HEAD {} returned {}",
                key, status
            ))),
        }
    }

    async fn initiate_multipart(&self, key: &str) -> Result<String> {
        let resource = format!("/{}/{}?uploads", self.bucket, key);
        let date = Self::date_header();
        let response = self
            .client
            .post(self.object_url(key, "?uploads"))
            .header(header::DATE, &date)
            .header(
                header::AUTHORIZATION,
                self.authorization("POST", "", &date, &resource),
            )
            .send()
            .await
            .map_err(|e| CommitError::Push(format!("initiate multipart upload: {}", error_chain(&e))))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(CommitError::Push(format!(
                "initiate multipart upload: {} {}",
                status,
                body.trim()
            )));
        }

        xml_text(&body, "UploadId")
            .map(str::to_string)
            .ok_or_else(|| {
                CommitError::Push("initiate multipart upload: no UploadId in response".to_string())
            })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        blob: &Path,
        chunk: Chunk,
    ) -> Result<UploadedPart> {
        let mut file = tokio::fs::File::open(blob)
            .await
            .map_err(|e| CommitError::Push(format!("open {}: {}", blob.display(), e)))?;
        file.seek(std::io::SeekFrom::Start(chunk.offset))
            .await
            .map_err(|e| CommitError::Push(format!("seek {}: {}", blob.display(), e)))?;
        let stream = tokio_util::io::ReaderStream::new(file.take(chunk.size));

        let query = format!("?partNumber={}&uploadId={}", chunk.number, upload_id);
        let resource = format!("/{}/{}{}", self.bucket, key, query);
        let date = Self::date_header();
        let response = self
            .client
            .put(self.object_url(key, &query))
            .header(header::DATE, &date)
            .header(
                header::AUTHORIZATION,
                self.authorization("PUT", "", &date, &resource),
            )
            .header(header::CONTENT_LENGTH, chunk.size)
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await
            .map_err(|e| {
                CommitError::Push(format!("upload part {}: {}", chunk.number, error_chain(&e)))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CommitError::Push(format!(
                "upload part {}: {} {}",
                chunk.number,
                status,
                body.trim()
            )));
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                CommitError::Push(format!("upload part {}: no ETag in response", chunk.number))
            })?;

        Ok(UploadedPart {
            number: chunk.number,
            etag,
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<()> {
        let query = format!("?uploadId={}", upload_id);
        let resource = format!("/{}/{}{}", self.bucket, key, query);
        let date = Self::date_header();
        let response = self
            .client
            .post(self.object_url(key, &query))
            .header(header::DATE, &date)
            .header(
                header::AUTHORIZATION,
                self.authorization("POST", "application/xml", &date, &resource),
            )
            .header(header::CONTENT_TYPE, "application/xml")
            .body(complete_body(parts))
            .send()
            .await
            .map_err(|e| CommitError::Push(format!("complete multipart upload: {}", error_chain(&e))))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CommitError::Push(format!(
                "complete multipart upload: {} {}",
                status,
                body.trim()
            )));
        }
        Ok(())
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        let query = format!("?uploadId={}", upload_id);
        let resource = format!("/{}/{}{}", self.bucket, key, query);
        let date = Self::date_header();
        let result = self
            .client
            .delete(self.object_url(key, &query))
            .header(header::DATE, &date)
            .header(
                header::AUTHORIZATION,
                self.authorization("DELETE", "", &date, &resource),
            )
            .send()
            .await;
        if let Err(err) = result {
            tracing::warn!(key, error = %err, "failed to abort multipart upload");
        }
    }

    async fn push_once(&self, blob: &Path, key: &str, size: u64) -> Result<()> {
        if self.object_exists(key).await? && !self.force_push {
            return Ok(());
        }

        let chunks = split_chunks(size, MULTIPART_CHUNK_SIZE)?;
        let upload_id = self.initiate_multipart(key).await?;

        let uploads = futures::future::try_join_all(chunks.into_iter().map(|chunk| {
            let upload_id = upload_id.clone();
            async move {
                with_retry(
                    || self.upload_part(key, &upload_id, blob, chunk),
                    RETRY_ATTEMPTS,
                )
                .await
            }
        }))
        .await;

        match uploads {
            Ok(parts) => self.complete_multipart(key, &upload_id, &parts).await,
            Err(err) => {
                self.abort_multipart(key, &upload_id).await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Backend for OssBackend {
    async fn push(&self, blob: &Path, descriptor: &OciDescriptor) -> Result<()> {
        let digest_hex = descriptor
            .digest
            .strip_prefix("sha256:")
            .unwrap_or(&descriptor.digest);
        let key = format!("{}{}", self.object_prefix, digest_hex);
        let size = tokio::fs::metadata(blob)
            .await
            .map_err(|e| CommitError::Push(format!("stat {}: {}", blob.display(), e)))?
            .len();

        with_retry(|| self.push_once(blob, &key, size), RETRY_ATTEMPTS).await
    }

    fn external(&self) -> bool {
        true
    }
}
