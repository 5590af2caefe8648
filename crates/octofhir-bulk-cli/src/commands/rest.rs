use std::io::{self, Read};

use anyhow::{Context, Result};
use colored::Colorize;
use octofhir_bulk::{FhirClient, RequestBody, build_transaction_bundle};
use serde_json::Value;

use crate::cli::OutputFormat;
use crate::output::{extract_bundle_entries, print_success, print_value};

/// Strip surrounding whitespace and a leading slash so paths join onto the FHIR base.
fn clean_url(url: &str) -> &str {
    url.trim().trim_start_matches('/')
}

/// JSON bodies are sent as JSON, anything else as plain text.
fn parse_body(input: &str) -> RequestBody {
    match serde_json::from_str::<Value>(input) {
        Ok(value) => RequestBody::Json(value),
        Err(_) => RequestBody::Text(input.to_string()),
    }
}

fn read_body(body: &Option<String>) -> Result<RequestBody> {
    let content = match body {
        Some(b) => b.clone(),
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read from stdin")?;
            buf
        }
    };
    Ok(parse_body(&content))
}

/// Re-shape a Bundle response into a transaction that recreates its resources.
fn to_transaction(value: &Value) -> Value {
    let resources: Vec<Value> = match extract_bundle_entries(value) {
        Some(entries) => entries
            .iter()
            .filter_map(|e| e.get("resource").cloned())
            .collect(),
        None => vec![value.clone()],
    };
    build_transaction_bundle(&resources)
}

pub async fn get(
    client: &FhirClient,
    url: &str,
    as_transaction: bool,
    format: OutputFormat,
) -> Result<()> {
    let resource = client.get(clean_url(url)).await?;
    if as_transaction {
        print_value(&to_transaction(&resource), format);
    } else {
        print_value(&resource, format);
    }
    Ok(())
}

pub async fn post(
    client: &FhirClient,
    url: &str,
    body: &Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let created = client.post(clean_url(url), read_body(body)?).await?;
    print_value(&created, format);
    Ok(())
}

pub async fn put(
    client: &FhirClient,
    url: &str,
    body: &Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let updated = client.put(clean_url(url), read_body(body)?).await?;
    print_value(&updated, format);
    Ok(())
}

pub async fn patch(
    client: &FhirClient,
    url: &str,
    body: &Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let patched = client.patch(clean_url(url), read_body(body)?).await?;
    print_value(&patched, format);
    Ok(())
}

pub async fn delete(client: &FhirClient, url: &str, format: OutputFormat) -> Result<()> {
    let url = clean_url(url);
    let response = client.delete(url).await?;
    print_success(&format!("Deleted {}", url.cyan()));
    if !response.is_null() {
        print_value(&response, format);
    }
    Ok(())
}
