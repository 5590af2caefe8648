//! Bulk export client (`$export`)
//!
//! Drives an export job through its whole life on the client side:
//!
//! ```text
//! Idle -> Kicked-off -> Polling -> Completed -> Downloading -> Done
//!              \_____________________/
//!          (kickoff answered 200 with a manifest)
//! ```
//!
//! Server replies are decoded once at the boundary into [`KickoffOutcome`]
//! and [`PollStatus`]; nothing downstream inspects raw status codes.

mod download;
mod poll;

pub use download::{DownloadReport, FailedDownload, local_file_name};
pub use poll::{PollPolicy, PollStatus};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::{BulkTransport, HttpReply};
use crate::{Error, Result};

/// One file listed in an export manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
}

/// Completion manifest returned by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportManifest {
    pub transaction_time: DateTime<Utc>,
    #[serde(default)]
    pub request: String,
    #[serde(default)]
    pub requires_access_token: bool,
    pub output: Vec<OutputFile>,
    #[serde(default)]
    pub error: Vec<OutputFile>,
}

/// Which `$export` endpoint the kickoff targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExportLevel {
    #[default]
    System,
    Patient,
    Group(String),
}

impl ExportLevel {
    fn path(&self) -> String {
        match self {
            ExportLevel::System => "$export".to_string(),
            ExportLevel::Patient => "Patient/$export".to_string(),
            ExportLevel::Group(id) => format!("Group/{id}/$export"),
        }
    }
}

impl fmt::Display for ExportLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportLevel::System => write!(f, "system"),
            ExportLevel::Patient => write!(f, "Patient"),
            ExportLevel::Group(id) => write!(f, "Group/{id}"),
        }
    }
}

impl std::str::FromStr for ExportLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" | "system" => Ok(ExportLevel::System),
            "Patient" => Ok(ExportLevel::Patient),
            other => match other.strip_prefix("Group/") {
                Some(id) if !id.is_empty() && !id.contains('/') => {
                    Ok(ExportLevel::Group(id.to_string()))
                }
                _ => Err(format!(
                    "Invalid export level \"{other}\". Expected: system, Patient or Group/<id>"
                )),
            },
        }
    }
}

/// Optional filters for the kickoff request.
#[derive(Debug, Clone, Default)]
pub struct ExportCriteria {
    pub level: ExportLevel,
    /// Resource types for `_type` (joined with commas).
    pub resource_types: Vec<String>,
    pub since: Option<DateTime<Utc>>,
}

impl ExportCriteria {
    /// Query parameters in the order `_type`, `_since`.
    pub fn query(&self) -> Vec<(String, String)> {
        let mut params = Vec::new();
        if !self.resource_types.is_empty() {
            params.push(("_type".to_string(), self.resource_types.join(",")));
        }
        if let Some(since) = self.since {
            params.push((
                "_since".to_string(),
                since.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            ));
        }
        params
    }
}

/// Decoded reply to the kickoff request.
#[derive(Debug, Clone, PartialEq)]
pub enum KickoffOutcome {
    Accepted { status_url: String },
    Completed(ExportManifest),
}

impl KickoffOutcome {
    pub fn decode(url: &str, reply: &HttpReply) -> Result<Self> {
        match reply.status {
            202 => match reply.content_location.as_deref() {
                Some(location) if !location.trim().is_empty() => Ok(KickoffOutcome::Accepted {
                    status_url: location.trim().to_string(),
                }),
                _ => Err(unexpected(url, reply, "202 Accepted without Content-Location")),
            },
            200 => decode_manifest(url, reply).map(KickoffOutcome::Completed),
            _ => Err(unexpected(url, reply, "expected 202 Accepted")),
        }
    }
}

/// In-memory handle for one export job.
#[derive(Debug, Clone, Default)]
pub struct ExportJob {
    status_url: Option<String>,
    manifest: Option<ExportManifest>,
}

impl ExportJob {
    pub fn status_url(&self) -> Option<&str> {
        self.status_url.as_deref()
    }

    pub fn is_completed(&self) -> bool {
        self.manifest.is_some()
    }

    pub fn manifest(&self) -> Option<&ExportManifest> {
        self.manifest.as_ref()
    }

    pub fn transaction_time(&self) -> Option<DateTime<Utc>> {
        self.manifest.as_ref().map(|m| m.transaction_time)
    }

    /// Output files in manifest order; empty until the job completes.
    pub fn output(&self) -> &[OutputFile] {
        self.manifest.as_ref().map(|m| m.output.as_slice()).unwrap_or(&[])
    }
}

/// Export orchestrator: kickoff, polling and download over a [`BulkTransport`].
pub struct Exporter<'a, T: BulkTransport + ?Sized> {
    transport: &'a T,
    policy: PollPolicy,
}

impl<'a, T: BulkTransport + ?Sized> Exporter<'a, T> {
    pub fn new(transport: &'a T, policy: PollPolicy) -> Self {
        Self { transport, policy }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Issue the kickoff request and return a job handle.
    ///
    /// A job whose kickoff already carried the manifest is returned completed.
    pub async fn start_export(&self, criteria: &ExportCriteria) -> Result<ExportJob> {
        let url = self.transport.fhir_url(&criteria.level.path());
        let query = criteria.query();
        tracing::debug!(url = %url, ?query, "Sending bulk export kickoff");

        let reply = self.transport.kickoff(&url, &query).await?;
        match KickoffOutcome::decode(&url, &reply)? {
            KickoffOutcome::Accepted { status_url } => {
                let status_url = self.resolve_status_url(&status_url);
                tracing::info!(
                    status_url = %status_url,
                    level = %criteria.level,
                    "Bulk export job accepted"
                );
                Ok(ExportJob {
                    status_url: Some(status_url),
                    manifest: None,
                })
            }
            KickoffOutcome::Completed(manifest) => {
                tracing::info!(
                    files = manifest.output.len(),
                    "Bulk export completed synchronously"
                );
                Ok(ExportJob {
                    status_url: None,
                    manifest: Some(manifest),
                })
            }
        }
    }

    /// Resolve `Content-Location` as a URI reference against the FHIR base:
    /// `bulkdata/1` lands under the base, `/jobs/1` under the server origin.
    fn resolve_status_url(&self, location: &str) -> String {
        let base = format!("{}/", self.transport.fhir_url("").trim_end_matches('/'));
        match url::Url::parse(&base).and_then(|base| base.join(location)) {
            Ok(url) => url.to_string(),
            Err(_) => self.transport.fhir_url(location),
        }
    }
}

fn decode_manifest(url: &str, reply: &HttpReply) -> Result<ExportManifest> {
    let body = reply
        .json()
        .map_err(|_| unexpected(url, reply, "body is not JSON"))?;
    if !body.get("output").is_some_and(Value::is_array) {
        let what = body
            .get("resourceType")
            .and_then(|v| v.as_str())
            .unwrap_or("body");
        return Err(unexpected(
            url,
            reply,
            &format!("{what} has no output array"),
        ));
    }
    serde_json::from_value(body)
        .map_err(|e| unexpected(url, reply, &format!("invalid export manifest: {e}")))
}

fn unexpected(url: &str, reply: &HttpReply, reason: &str) -> Error {
    let detail = crate::client::operation_outcome_diagnostics(&reply.body);
    Error::UnexpectedResponse {
        url: url.to_string(),
        status: reply.status,
        reason: match detail {
            Some(d) => format!("{reason}: {d}"),
            None => reason.to_string(),
        },
    }
}
