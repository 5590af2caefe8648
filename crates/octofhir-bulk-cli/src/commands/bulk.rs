use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use octofhir_bulk::{ExportCriteria, Exporter, FhirClient, Importer, NdjsonReader, PollPolicy};
use tokio_util::sync::CancellationToken;

use crate::cli::{ExportArgs, ImportArgs, OutputFormat};
use crate::output::{print_batch_report, print_error, print_success};

pub async fn export(
    client: &FhirClient,
    args: &ExportArgs,
    policy: PollPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    let criteria = ExportCriteria {
        level: args.export_level.clone(),
        resource_types: args.types.clone(),
        since: args.since,
    };
    let exporter = Exporter::new(client, policy);

    let mut job = exporter
        .start_export(&criteria)
        .await
        .context("Bulk export kickoff failed")?;
    if let Some(status_url) = job.status_url() {
        println!("{} {}", "Export accepted, polling".cyan(), status_url);
    }

    exporter
        .poll_until_complete(&mut job, cancel)
        .await
        .context("Bulk export did not complete")?;

    let report = exporter
        .download_all(&job, &args.target_directory, cancel, |path| {
            print_success(&created_line(path))
        })
        .await
        .context("Bulk export download failed")?;

    for failed in &report.failed {
        print_error(&format!(
            "{} ({}) failed: {}",
            failed.file.url, failed.file.resource_type, failed.error
        ));
    }
    if let Some(manifest) = job.manifest() {
        for err in &manifest.error {
            print_error(&format!(
                "Server reported export errors for {}: {}",
                err.resource_type, err.url
            ));
        }
    }

    if !report.is_complete() {
        anyhow::bail!(
            "{} of {} export files failed to download",
            report.failed.len(),
            job.output().len()
        );
    }
    Ok(())
}

/// `<filename> is created`, printed once per downloaded file.
fn created_line(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    format!("{name} is created")
}

pub async fn import(
    client: &FhirClient,
    args: &ImportArgs,
    format: OutputFormat,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut reader = NdjsonReader::open(Some(&args.file))
        .await
        .with_context(|| format!("Failed to open {}", args.file.display()))?;

    let summary = Importer::new(client, args.num_resources_per_request)
        .run(&mut reader, cancel, |report| print_batch_report(report, format))
        .await
        .with_context(|| format!("Bulk import of {} aborted", args.file.display()))?;

    let message = format!(
        "Imported {} resources in {} transaction(s)",
        summary.resources, summary.batches
    );
    if summary.failed_entries > 0 {
        print_error(&format!(
            "{message}; {} resource(s) rejected by the server",
            summary.failed_entries
        ));
    } else {
        print_success(&message);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> FhirClient {
        FhirClient::new(&format!("{}/fhir/R4", server.uri()), None)
    }

    async fn mount_manifest(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/fhir/R4/$export"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "transactionTime": "2023-05-18T22:55:31.280Z",
                "request": format!("{}/fhir/R4/$export", server.uri()),
                "requiresAccessToken": false,
                "output": [
                    { "type": "Patient", "url": format!("{}/files/patient.ndjson", server.uri()) },
                    { "type": "Observation", "url": format!("{}/files/observation.ndjson", server.uri()) }
                ],
                "error": []
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/patient.ndjson"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"resourceType\":\"Patient\"}\n"))
            .mount(server)
            .await;
    }

    fn export_args(dir: &Path) -> ExportArgs {
        ExportArgs {
            export_level: Default::default(),
            types: vec![],
            since: None,
            target_directory: dir.to_path_buf(),
        }
    }

    #[test]
    fn test_created_line_uses_file_name() {
        let path = PathBuf::from("out/Project_data_55555_eeeeee_ndjson.ndjson");
        assert_eq!(
            created_line(&path),
            "Project_data_55555_eeeeee_ndjson.ndjson is created"
        );
    }

    #[tokio::test]
    async fn test_export_writes_files_and_succeeds() {
        let server = MockServer::start().await;
        mount_manifest(&server).await;
        Mock::given(method("GET"))
            .and(path("/files/observation.ndjson"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"resourceType\":\"Observation\"}\n"))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        export(
            &client(&server),
            &export_args(dir.path()),
            PollPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(dir.path().join("Patient_files_patient_ndjson.ndjson").exists());
        assert!(dir.path().join("Observation_files_observation_ndjson.ndjson").exists());
    }

    #[tokio::test]
    async fn test_export_fails_when_a_download_fails() {
        let server = MockServer::start().await;
        mount_manifest(&server).await;
        Mock::given(method("GET"))
            .and(path("/files/observation.ndjson"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let dir = tempfile::tempdir().unwrap();

        let err = export(
            &client(&server),
            &export_args(dir.path()),
            PollPolicy::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "1 of 2 export files failed to download");
        assert!(dir.path().join("Patient_files_patient_ndjson.ndjson").exists());
    }

    #[tokio::test]
    async fn test_import_fails_on_malformed_line() {
        let server = MockServer::start().await;
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "not-json\n").unwrap();
        let args = ImportArgs {
            file: file.path().to_path_buf(),
            num_resources_per_request: None,
        };

        let err = import(
            &client(&server),
            &args,
            OutputFormat::Json,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<octofhir_bulk::Error>(),
            Some(octofhir_bulk::Error::MalformedResource { line_number: 1, .. })
        ));
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
