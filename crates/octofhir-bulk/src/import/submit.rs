use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transport::BulkTransport;
use crate::{Error, Result};

/// `entry[].response` of a `transaction-response` Bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryOutcome {
    /// HTTP status as sent by the server, e.g. `"201"` or `"201 Created"`.
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Value>,
}

impl EntryOutcome {
    pub fn status_code(&self) -> Option<u16> {
        self.status
            .split_whitespace()
            .next()
            .and_then(|code| code.parse().ok())
    }

    pub fn is_success(&self) -> bool {
        self.status_code().is_some_and(|c| (200..300).contains(&c))
    }

    /// First human readable message of the OperationOutcome, if any.
    pub fn outcome_text(&self) -> Option<&str> {
        self.outcome
            .as_ref()?
            .get("issue")?
            .as_array()?
            .iter()
            .find_map(|issue| {
                issue
                    .get("details")
                    .and_then(|d| d.get("text"))
                    .or_else(|| issue.get("diagnostics"))
                    .and_then(|t| t.as_str())
            })
    }
}

/// Per-resource outcome of one submitted batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    /// 1-based position of the batch in the import.
    pub batch_number: usize,
    /// Input line number of the batch's first resource.
    pub first_line: usize,
    pub submitted: usize,
    pub entries: Vec<EntryOutcome>,
}

impl BatchReport {
    /// Entries the server rejected inside an otherwise accepted transaction.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &EntryOutcome)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_success())
    }

    pub fn has_failures(&self) -> bool {
        self.failures().next().is_some()
    }
}

/// POST one transaction bundle to the FHIR base and decode the per-entry responses.
///
/// Any non-2xx status for the transaction as a whole is an error.
pub async fn submit_batch<T: BulkTransport + ?Sized>(
    transport: &T,
    bundle: &Value,
) -> Result<Vec<EntryOutcome>> {
    let url = transport.fhir_url("");
    let reply = transport.post_bundle(&url, bundle).await?;

    if !reply.is_success() {
        let reason = crate::client::operation_outcome_diagnostics(&reply.body)
            .unwrap_or_else(|| reply.body.clone());
        return Err(Error::UnexpectedResponse {
            url,
            status: reply.status,
            reason,
        });
    }

    let body = reply.json().map_err(|e| Error::UnexpectedResponse {
        url: url.clone(),
        status: reply.status,
        reason: format!("transaction response is not JSON: {e}"),
    })?;

    let entries: Vec<EntryOutcome> = body
        .get("entry")
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .map(|entry| {
                    entry
                        .get("response")
                        .cloned()
                        .and_then(|r| serde_json::from_value::<EntryOutcome>(r).ok())
                        .unwrap_or_default()
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(status: &str) -> EntryOutcome {
        EntryOutcome {
            status: status.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_code_parsing() {
        assert_eq!(entry("201").status_code(), Some(201));
        assert_eq!(entry("201 Created").status_code(), Some(201));
        assert!(entry("200 OK").is_success());
        assert!(!entry("400 Bad Request").is_success());
        assert!(!entry("").is_success());
    }

    #[test]
    fn test_outcome_text() {
        let outcome = EntryOutcome {
            status: "201".into(),
            location: Some("Patient/1/_history/1".into()),
            outcome: Some(json!({
                "resourceType": "OperationOutcome",
                "id": "created",
                "issue": [{ "severity": "information", "code": "informational", "details": { "text": "Created" } }]
            })),
        };
        assert_eq!(outcome.outcome_text(), Some("Created"));
        assert_eq!(entry("201").outcome_text(), None);
    }

    #[test]
    fn test_report_failures() {
        let report = BatchReport {
            batch_number: 1,
            first_line: 1,
            submitted: 3,
            entries: vec![entry("201"), entry("422"), entry("201 Created")],
        };
        let failed: Vec<_> = report.failures().map(|(i, _)| i).collect();
        assert_eq!(failed, [1]);
        assert!(report.has_failures());
    }
}
