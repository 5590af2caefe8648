use colored::Colorize;
use octofhir_bulk::{BatchReport, EntryOutcome};
use serde_json::Value;
use tabled::builder::Builder;
use tabled::settings::Style;

use crate::cli::OutputFormat;

pub fn print_value(value: &Value, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", pretty(value)),
        OutputFormat::Table => print_as_table(value),
    }
}

pub fn print_success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

pub fn print_warning(msg: &str) {
    eprintln!("{} {}", "!".yellow(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// One pretty-printed response excerpt per entry of a submitted transaction.
pub fn print_batch_report(report: &BatchReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for entry in &report.entries {
                let excerpt = serde_json::to_value(entry).unwrap_or(Value::Null);
                println!("{}", pretty(&excerpt));
            }
        }
        OutputFormat::Table => {
            let mut builder = Builder::default();
            builder.push_record(["#", "Status", "Location", "Outcome"]);
            for (i, entry) in report.entries.iter().enumerate() {
                builder.push_record([
                    (report.first_line + i).to_string(),
                    entry.status.clone(),
                    entry.location.clone().unwrap_or_else(|| "-".to_string()),
                    entry.outcome_text().unwrap_or("-").to_string(),
                ]);
            }
            println!("{}", builder.build().with(Style::rounded()));
        }
    }

    for (i, entry) in report.failures() {
        print_warning(&format!(
            "Batch {} entry {} rejected: {}",
            report.batch_number,
            i + 1,
            describe(entry)
        ));
    }
}

fn describe(entry: &EntryOutcome) -> String {
    match entry.outcome_text() {
        Some(text) => format!("{} ({text})", entry.status),
        None => entry.status.clone(),
    }
}

fn print_as_table(value: &Value) {
    if let Some(entries) = extract_bundle_entries(value) {
        if entries.is_empty() {
            println!("No resources found.");
            return;
        }
        let mut builder = Builder::default();
        builder.push_record(["ID", "ResourceType", "LastUpdated"]);
        for entry in entries {
            let resource = entry.get("resource").unwrap_or(entry);
            let id = resource.get("id").and_then(|v| v.as_str()).unwrap_or("-");
            let rt = resource
                .get("resourceType")
                .and_then(|v| v.as_str())
                .unwrap_or("-");
            let updated = resource
                .get("meta")
                .and_then(|m| m.get("lastUpdated"))
                .and_then(|v| v.as_str())
                .unwrap_or("-");
            builder.push_record([id, rt, updated]);
        }
        let total = value.get("total").and_then(|v| v.as_u64());
        let table = builder.build().with(Style::rounded()).to_string();
        println!("{table}");
        if let Some(total) = total {
            println!("Total: {total}");
        }
    } else {
        // Single resource — show key-value
        let rt = value
            .get("resourceType")
            .and_then(|v| v.as_str())
            .unwrap_or("Resource");
        let id = value.get("id").and_then(|v| v.as_str()).unwrap_or("-");
        println!("{} {}/{}", "Resource:".cyan(), rt.cyan(), id.cyan());
        println!("{}", pretty(value));
    }
}

pub fn extract_bundle_entries(value: &Value) -> Option<&Vec<Value>> {
    if value.get("resourceType")?.as_str()? == "Bundle" {
        value.get("entry")?.as_array()
    } else {
        None
    }
}
