//! GitLab REST transport.
//!
//! The importers treat this as a black-box capability: paginated listing,
//! single fetches, posts, deletes, and raw file retrieval against a
//! server's API. Rate limiting and retry policy live behind this seam.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::Server;

const PAGE_SIZE: usize = 100;

#[async_trait]
pub trait GitLabApi: Send + Sync {
    /// GET a single object.
    async fn fetch(&self, server: &Server, uri: &str) -> Result<Value>;

    /// GET every page of a list endpoint.
    async fn fetch_all(&self, server: &Server, uri: &str) -> Result<Vec<Value>>;

    /// GET a raw file body (repository files, artifacts).
    async fn fetch_raw(&self, server: &Server, uri: &str) -> Result<Vec<u8>>;

    /// POST a JSON payload, returning the created object.
    async fn post(&self, server: &Server, uri: &str, payload: Value) -> Result<Value>;

    /// DELETE an object. Missing objects are not an error.
    async fn delete(&self, server: &Server, uri: &str) -> Result<()>;
}

/// reqwest-backed implementation talking to `<api_url>/api/v4`.
pub struct HttpGitLab {
    client: reqwest::Client,
}

impl HttpGitLab {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn credentials<'a>(&self, server: &'a Server) -> Result<(&'a str, &'a str)> {
        let url = server
            .api_url
            .as_deref()
            .ok_or_else(|| Error::Precondition(format!("server {} has no API URL", server.id)))?;
        let token = server.api_token.as_deref().ok_or_else(|| {
            Error::Precondition(format!("server {} has no access token", server.id))
        })?;
        Ok((url.trim_end_matches('/'), token))
    }

    async fn request(
        &self,
        server: &Server,
        method: reqwest::Method,
        uri: &str,
        payload: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let (base, token) = self.credentials(server)?;
        let mut req = self
            .client
            .request(method, format!("{base}/api/v4{uri}"))
            .header("PRIVATE-TOKEN", token);
        if let Some(body) = payload {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            let message = resp.text().await.unwrap_or_default();
            Err(Error::GitLab {
                status: status.as_u16(),
                message,
            })
        }
    }
}

impl Default for HttpGitLab {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitLabApi for HttpGitLab {
    async fn fetch(&self, server: &Server, uri: &str) -> Result<Value> {
        let resp = self.request(server, reqwest::Method::GET, uri, None).await?;
        Ok(resp.json().await?)
    }

    async fn fetch_all(&self, server: &Server, uri: &str) -> Result<Vec<Value>> {
        let sep = if uri.contains('?') { '&' } else { '?' };
        let mut objects = Vec::new();
        let mut page = 1;
        loop {
            let paged = format!("{uri}{sep}page={page}&per_page={PAGE_SIZE}");
            let resp = self
                .request(server, reqwest::Method::GET, &paged, None)
                .await?;
            let batch: Vec<Value> = resp.json().await?;
            let len = batch.len();
            objects.extend(batch);
            if len < PAGE_SIZE {
                return Ok(objects);
            }
            page += 1;
        }
    }

    async fn fetch_raw(&self, server: &Server, uri: &str) -> Result<Vec<u8>> {
        let resp = self.request(server, reqwest::Method::GET, uri, None).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn post(&self, server: &Server, uri: &str, payload: Value) -> Result<Value> {
        let resp = self
            .request(server, reqwest::Method::POST, uri, Some(&payload))
            .await?;
        Ok(resp.json().await?)
    }

    async fn delete(&self, server: &Server, uri: &str) -> Result<()> {
        match self.request(server, reqwest::Method::DELETE, uri, None).await {
            Ok(_) => Ok(()),
            Err(Error::GitLab { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
