use std::num::NonZeroUsize;

use serde_json::{Value, json};

use crate::{Error, Result};

/// Ordered resources destined for one transaction bundle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportBatch {
    first_line: usize,
    resources: Vec<Value>,
}

impl ImportBatch {
    /// Line number of the first resource in the batch.
    pub fn first_line(&self) -> usize {
        self.first_line
    }

    pub fn resources(&self) -> &[Value] {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn to_bundle(&self) -> Value {
        build_transaction_bundle(&self.resources)
    }
}

/// Groups parsed NDJSON lines into batches of at most `limit` resources.
///
/// Without a limit everything ends up in the single batch returned by
/// [`finish`](Self::finish).
#[derive(Debug)]
pub struct BatchAccumulator {
    limit: Option<NonZeroUsize>,
    current: ImportBatch,
}

impl BatchAccumulator {
    pub fn new(limit: Option<NonZeroUsize>) -> Self {
        Self {
            limit,
            current: ImportBatch::default(),
        }
    }

    /// Parse one line and add it to the open batch.
    ///
    /// Returns the batch once it is full. Whitespace-only lines are skipped.
    pub fn push(&mut self, line_number: usize, line: &str) -> Result<Option<ImportBatch>> {
        if line.trim().is_empty() {
            return Ok(None);
        }
        let resource = parse_resource(line_number, line)?;

        if self.current.is_empty() {
            self.current.first_line = line_number;
        }
        self.current.resources.push(resource);

        match self.limit {
            Some(limit) if self.current.len() >= limit.get() => {
                Ok(Some(std::mem::take(&mut self.current)))
            }
            _ => Ok(None),
        }
    }

    /// Hand out the remaining partial batch, if any.
    pub fn finish(&mut self) -> Option<ImportBatch> {
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }
}

fn parse_resource(line_number: usize, line: &str) -> Result<Value> {
    let malformed = |reason: String| Error::MalformedResource {
        line_number,
        line: line.to_string(),
        reason,
    };

    let resource: Value = serde_json::from_str(line).map_err(|e| malformed(e.to_string()))?;
    match resource.get("resourceType") {
        Some(Value::String(rt)) if !rt.is_empty() => Ok(resource),
        _ => Err(malformed("missing resourceType".to_string())),
    }
}

/// Wrap resources into a FHIR `transaction` Bundle of create entries.
///
/// One entry per resource, in order, each `POST`ed to its resource type.
pub fn build_transaction_bundle(resources: &[Value]) -> Value {
    let entries: Vec<Value> = resources
        .iter()
        .map(|resource| {
            let resource_type = resource
                .get("resourceType")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            json!({
                "resource": resource,
                "request": {
                    "method": "POST",
                    "url": resource_type,
                },
            })
        })
        .collect();

    json!({
        "resourceType": "Bundle",
        "type": "transaction",
        "entry": entries,
    })
}
