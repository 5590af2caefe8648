//! HTTP seam shared by the export and import pipelines.

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWrite;

use crate::Result;

/// A fully buffered HTTP reply.
///
/// Only the pieces the pipelines inspect are kept: the status code, the
/// `Content-Location` header of an accepted export, an optional `Retry-After`
/// hint and the raw body text.
#[derive(Debug, Clone, Default)]
pub struct HttpReply {
    pub status: u16,
    pub content_location: Option<String>,
    pub retry_after: Option<u64>,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_content_location(mut self, location: impl Into<String>) -> Self {
        self.content_location = Some(location.into());
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON. An empty body yields `Value::Null`.
    pub fn json(&self) -> Result<Value> {
        if self.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Transport used by [`Exporter`](crate::Exporter) and [`Importer`](crate::Importer).
///
/// Implementations issue one request per call and never retry on their own;
/// status interpretation is left to the pipelines.
#[async_trait]
pub trait BulkTransport: Send + Sync {
    /// Absolute URL for a path relative to the FHIR base. An empty path is the base itself.
    fn fhir_url(&self, path: &str) -> String;

    /// Export kickoff request (`Prefer: respond-async`).
    async fn kickoff(&self, url: &str, query: &[(String, String)]) -> Result<HttpReply>;

    /// Status poll of a running export job.
    async fn poll(&self, status_url: &str) -> Result<HttpReply>;

    /// POST a Bundle to `url`.
    async fn post_bundle(&self, url: &str, bundle: &Value) -> Result<HttpReply>;

    /// Stream the body at `url` into `sink`, returning the number of bytes written.
    ///
    /// `authenticated` is false for pre-signed URLs.
    async fn download_to(
        &self,
        url: &str,
        authenticated: bool,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;
}
