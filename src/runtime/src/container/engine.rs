//! Minimal HTTP client for an engine's Unix socket.
//!
//! The engines expose the container-inspect JSON surface plus pause and
//! unpause endpoints over local Unix sockets.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri};

use nydus_commit_core::error::{CommitError, Result};

use crate::util::error_chain;

pub struct EngineClient {
    socket: PathBuf,
    client: Client<UnixConnector, Full<Bytes>>,
}

impl EngineClient {
    pub fn new(socket: &Path) -> Self {
        Self {
            socket: socket.to_path_buf(),
            client: Client::unix(),
        }
    }

    /// GET `endpoint` and parse the response body as JSON.
    pub async fn get_json(&self, endpoint: &str) -> Result<serde_json::Value> {
        let uri: hyper::Uri = Uri::new(&self.socket, endpoint).into();
        let response = self.client.get(uri).await.map_err(|e| {
            CommitError::Inspect(format!(
                "GET {} on {}: {}",
                endpoint,
                self.socket.display(),
                error_chain(&e)
            ))
        })?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| CommitError::Inspect(format!("read response body: {}", error_chain(&e))))?
            .to_bytes();

        if !status.is_success() {
            return Err(CommitError::Inspect(format!(
                "GET {}: {} {}",
                endpoint,
                status,
                String::from_utf8_lossy(&body).trim()
            )));
        }

        serde_json::from_slice(&body)
            .map_err(|e| CommitError::Inspect(format!("parse inspect json: {}", e)))
    }

    /// POST `endpoint` with an empty body, expecting a success status.
    pub async fn post(&self, endpoint: &str) -> Result<()> {
        let uri: hyper::Uri = Uri::new(&self.socket, endpoint).into();
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| CommitError::Inspect(format!("build request: {}", e)))?;

        let response = self.client.request(request).await.map_err(|e| {
            CommitError::Inspect(format!(
                "POST {} on {}: {}",
                endpoint,
                self.socket.display(),
                error_chain(&e)
            ))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();
            return Err(CommitError::Inspect(format!(
                "POST {}: {} {}",
                endpoint,
                status,
                String::from_utf8_lossy(&body).trim()
            )));
        }

        Ok(())
    }
}
