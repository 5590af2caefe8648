use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_LOCATION, HeaderName, RETRY_AFTER};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::transport::{BulkTransport, HttpReply};
use crate::{Error, FHIR_JSON, Result};

/// What FhirClient needs to set the Authorization header
#[derive(Debug, Clone)]
pub enum AuthHeader {
    Basic { username: String, password: String },
    Bearer { token: String },
}

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub auth: Option<AuthHeader>,
    /// Per-request timeout, applied to every call including downloads.
    pub timeout: Option<Duration>,
}

/// Body of a REST passthrough request.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    Text(String),
}

pub struct FhirClient {
    http: reqwest::Client,
    base_url: String,
    auth: Option<AuthHeader>,
}

impl FhirClient {
    /// `base_url` is the FHIR base (e.g. `https://example.org/fhir/R4`).
    pub fn new(base_url: &str, auth: Option<AuthHeader>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    /// Like [`FhirClient::new`] but with a configured HTTP client; fails when
    /// reqwest cannot build one for the given options.
    pub fn with_options(base_url: &str, options: ClientOptions) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            http: builder.build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: options.auth,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, url);
        self.authorize(req).header("Accept", FHIR_JSON)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth {
            Some(AuthHeader::Basic { username, password }) => {
                req.basic_auth(username, Some(password))
            }
            Some(AuthHeader::Bearer { token }) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Resolve a user-supplied path: absolute URLs pass through, anything else
    /// is taken relative to the FHIR base.
    fn resolve(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            self.fhir_url(path)
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        let url = self.resolve(path);
        let resp = self.request(reqwest::Method::GET, &url).send().await?;
        handle_response(&url, resp).await
    }

    pub async fn post(&self, path: &str, body: RequestBody) -> Result<Value> {
        self.send_with_body(reqwest::Method::POST, path, body, FHIR_JSON)
            .await
    }

    pub async fn put(&self, path: &str, body: RequestBody) -> Result<Value> {
        self.send_with_body(reqwest::Method::PUT, path, body, FHIR_JSON)
            .await
    }

    pub async fn patch(&self, path: &str, body: RequestBody) -> Result<Value> {
        self.send_with_body(
            reqwest::Method::PATCH,
            path,
            body,
            "application/json-patch+json",
        )
        .await
    }

    pub async fn delete(&self, path: &str) -> Result<Value> {
        let url = self.resolve(path);
        let resp = self.request(reqwest::Method::DELETE, &url).send().await?;
        handle_response(&url, resp).await
    }

    async fn send_with_body(
        &self,
        method: reqwest::Method,
        path: &str,
        body: RequestBody,
        json_content_type: &str,
    ) -> Result<Value> {
        let url = self.resolve(path);
        let req = self.request(method, &url);
        let req = match body {
            RequestBody::Json(value) => req
                .header("Content-Type", json_content_type)
                .body(serde_json::to_vec(&value)?),
            RequestBody::Text(text) => req.header("Content-Type", "text/plain").body(text),
        };
        let resp = req.send().await?;
        handle_response(&url, resp).await
    }
}

#[async_trait]
impl BulkTransport for FhirClient {
    fn fhir_url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    async fn kickoff(&self, url: &str, query: &[(String, String)]) -> Result<HttpReply> {
        let resp = self
            .request(reqwest::Method::GET, url)
            .header("Prefer", "respond-async")
            .query(query)
            .send()
            .await?;
        into_reply(resp).await
    }

    async fn poll(&self, status_url: &str) -> Result<HttpReply> {
        let resp = self
            .request(reqwest::Method::GET, status_url)
            .send()
            .await?;
        into_reply(resp).await
    }

    async fn post_bundle(&self, url: &str, bundle: &Value) -> Result<HttpReply> {
        let resp = self
            .request(reqwest::Method::POST, url)
            .header("Content-Type", FHIR_JSON)
            .body(serde_json::to_vec(bundle)?)
            .send()
            .await?;
        into_reply(resp).await
    }

    async fn download_to(
        &self,
        url: &str,
        authenticated: bool,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let req = self.http.get(url).header("Accept", "application/fhir+ndjson");
        let req = if authenticated { self.authorize(req) } else { req };
        let mut resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::UnexpectedResponse {
                url: url.to_string(),
                status: status.as_u16(),
                reason: body,
            });
        }

        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        Ok(written)
    }
}

async fn into_reply(resp: reqwest::Response) -> Result<HttpReply> {
    let status = resp.status().as_u16();
    let content_location = header_str(&resp, CONTENT_LOCATION);
    let retry_after =
        header_str(&resp, RETRY_AFTER).and_then(|v| v.trim().parse::<u64>().ok());
    let body = resp.text().await?;
    Ok(HttpReply {
        status,
        content_location,
        retry_after,
        body,
    })
}

fn header_str(resp: &reqwest::Response, name: HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn handle_response(url: &str, resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();

    if !status.is_success() {
        let reason = operation_outcome_diagnostics(&body).unwrap_or(body);
        return Err(Error::UnexpectedResponse {
            url: url.to_string(),
            status: status.as_u16(),
            reason,
        });
    }

    if body.is_empty() {
        return Ok(Value::Null);
    }

    Ok(serde_json::from_str(&body)?)
}

/// Joined `issue[].diagnostics` (or `details.text`) of an OperationOutcome body.
pub(crate) fn operation_outcome_diagnostics(body: &str) -> Option<String> {
    let json: Value = serde_json::from_str(body).ok()?;
    if json.get("resourceType").and_then(|v| v.as_str()) != Some("OperationOutcome") {
        return None;
    }
    let msgs: Vec<&str> = json
        .get("issue")?
        .as_array()?
        .iter()
        .filter_map(|i| {
            i.get("diagnostics")
                .or_else(|| i.get("details").and_then(|d| d.get("text")))
                .and_then(|d| d.as_str())
        })
        .collect();
    if msgs.is_empty() {
        None
    } else {
        Some(msgs.join("; "))
    }
}
