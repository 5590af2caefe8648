use std::num::NonZeroUsize;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use octofhir_bulk::ExportLevel;

#[derive(Parser)]
#[command(name = "octofhir-bulk")]
#[command(about = "FHIR bulk data CLI — $export download and NDJSON transaction import")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// FHIR base URL (overrides config and OCTOFHIR_URL env var)
    #[arg(short, long, global = true, env = "OCTOFHIR_URL")]
    pub server: Option<String>,

    /// Config profile name
    #[arg(short, long, global = true, env = "OCTOFHIR_PROFILE", default_value = "default")]
    pub profile: String,

    /// Bearer token sent with FHIR requests (overrides the profile token)
    #[arg(long, global = true, env = "OCTOFHIR_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Output format
    #[arg(short, long, global = true)]
    pub format: Option<OutputFormat>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Json,
    Table,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bulk data export and import
    Bulk(BulkArgs),
    /// GET a resource or search URL (e.g. Patient/123)
    Get(GetArgs),
    /// POST a body to a URL
    Post(BodyArgs),
    /// PUT a body to a URL
    Put(BodyArgs),
    /// PATCH a URL with a JSON Patch body
    Patch(BodyArgs),
    /// DELETE a resource
    Delete(UrlArgs),
    /// Manage CLI configuration
    Config(ConfigArgs),
}

#[derive(clap::Args)]
pub struct BulkArgs {
    #[command(subcommand)]
    pub command: BulkCommands,
}

#[derive(Subcommand)]
pub enum BulkCommands {
    /// Run a $export job and download its output files
    Export(ExportArgs),
    /// Import an NDJSON file as transaction bundles
    Import(ImportArgs),
}

#[derive(clap::Args)]
pub struct ExportArgs {
    /// Export level: system, Patient or Group/<id>
    #[arg(short = 'e', long, default_value = "system")]
    pub export_level: ExportLevel,
    /// Resource types to export (comma separated or repeated)
    #[arg(short = 't', long = "types", value_delimiter = ',')]
    pub types: Vec<String>,
    /// Only resources changed after this RFC 3339 timestamp
    #[arg(long)]
    pub since: Option<DateTime<Utc>>,
    /// Directory the output files are written to
    #[arg(short = 'd', long, default_value = ".")]
    pub target_directory: PathBuf,
}

#[derive(clap::Args)]
pub struct ImportArgs {
    /// NDJSON file to import ("-" reads stdin)
    pub file: PathBuf,
    /// Resources per transaction bundle (default: the whole file in one bundle)
    #[arg(
        long = "numResourcesPerRequest",
        visible_alias = "num-resources-per-request"
    )]
    pub num_resources_per_request: Option<NonZeroUsize>,
}

#[derive(clap::Args)]
pub struct GetArgs {
    /// Resource URL (e.g. Patient/123 or Patient?name=Smith)
    pub url: String,
    /// Print a returned Bundle as a transaction bundle
    #[arg(long)]
    pub as_transaction: bool,
}

#[derive(clap::Args)]
pub struct BodyArgs {
    /// Resource URL
    pub url: String,
    /// Request body (JSON; anything else is sent as text)
    pub body: Option<String>,
}

#[derive(clap::Args)]
pub struct UrlArgs {
    /// Resource URL (e.g. Patient/123)
    pub url: String,
}

#[derive(clap::Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current config
    Show,
    /// Set config value
    Set(ConfigSetArgs),
}

#[derive(clap::Args)]
pub struct ConfigSetArgs {
    /// Key to set (server, format, token, poll_interval_secs, max_poll_attempts, request_timeout_secs)
    pub key: String,
    /// Value
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_bulk_export_args() {
        let cli = parse(&[
            "octofhir-bulk",
            "bulk",
            "export",
            "-t",
            "Patient,Observation",
            "--since",
            "2023-01-01T00:00:00Z",
            "-e",
            "Group/g1",
        ]);
        let Commands::Bulk(BulkArgs {
            command: BulkCommands::Export(args),
        }) = cli.command
        else {
            panic!("expected bulk export");
        };
        assert_eq!(args.types, ["Patient", "Observation"]);
        assert_eq!(args.export_level, ExportLevel::Group("g1".into()));
        assert_eq!(args.since.unwrap().to_rfc3339(), "2023-01-01T00:00:00+00:00");
        assert_eq!(args.target_directory, PathBuf::from("."));
    }

    #[test]
    fn test_bulk_import_args() {
        let cli = parse(&[
            "octofhir-bulk",
            "bulk",
            "import",
            "Patient.json",
            "--numResourcesPerRequest",
            "1",
        ]);
        let Commands::Bulk(BulkArgs {
            command: BulkCommands::Import(args),
        }) = cli.command
        else {
            panic!("expected bulk import");
        };
        assert_eq!(args.file, PathBuf::from("Patient.json"));
        assert_eq!(args.num_resources_per_request, NonZeroUsize::new(1));
    }

    #[test]
    fn test_import_rejects_zero_batch_size() {
        assert!(
            Cli::try_parse_from([
                "octofhir-bulk",
                "bulk",
                "import",
                "p.ndjson",
                "--numResourcesPerRequest",
                "0"
            ])
            .is_err()
        );
    }

    #[test]
    fn test_invalid_since_is_rejected() {
        assert!(
            Cli::try_parse_from(["octofhir-bulk", "bulk", "export", "--since", "yesterday"])
                .is_err()
        );
    }

    #[test]
    fn test_global_flags() {
        let cli = parse(&[
            "octofhir-bulk",
            "-vv",
            "--server",
            "http://localhost:8888/fhir",
            "get",
            "Patient/1",
            "--as-transaction",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.server.as_deref(), Some("http://localhost:8888/fhir"));
        assert!(matches!(cli.command, Commands::Get(GetArgs { as_transaction: true, .. })));
    }
}
