mod cli;
mod commands;
mod config;
mod observability;
mod output;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use octofhir_bulk::{AuthHeader, ClientOptions, FhirClient};
use tokio_util::sync::CancellationToken;

use cli::{BulkCommands, Cli, Commands, ConfigCommands};
use config::ProfileConfig;
use output::print_error;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        print_error(&format!("{e:#}"));
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    observability::init_tracing_with_level(observability::level_for_verbosity(cli.verbose));

    let profile_name = &cli.profile;
    let profile = config::load_profile(profile_name)?;
    let format = match cli.format {
        Some(f) => f,
        None => profile.output_format()?.unwrap_or_default(),
    };

    let cancel = CancellationToken::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_ctrl_c.cancel();
        }
    });

    match &cli.command {
        Commands::Bulk(args) => {
            let client = make_client(&cli, &profile)?;
            match &args.command {
                BulkCommands::Export(export_args) => {
                    commands::bulk::export(&client, export_args, profile.poll_policy(), &cancel)
                        .await?;
                }
                BulkCommands::Import(import_args) => {
                    commands::bulk::import(&client, import_args, format, &cancel).await?;
                }
            }
        }
        Commands::Get(args) => {
            let client = make_client(&cli, &profile)?;
            commands::rest::get(&client, &args.url, args.as_transaction, format).await?;
        }
        Commands::Post(args) => {
            let client = make_client(&cli, &profile)?;
            commands::rest::post(&client, &args.url, &args.body, format).await?;
        }
        Commands::Put(args) => {
            let client = make_client(&cli, &profile)?;
            commands::rest::put(&client, &args.url, &args.body, format).await?;
        }
        Commands::Patch(args) => {
            let client = make_client(&cli, &profile)?;
            commands::rest::patch(&client, &args.url, &args.body, format).await?;
        }
        Commands::Delete(args) => {
            let client = make_client(&cli, &profile)?;
            commands::rest::delete(&client, &args.url, format).await?;
        }
        Commands::Config(args) => match &args.command {
            ConfigCommands::Show => show_config(profile_name, &profile),
            ConfigCommands::Set(set_args) => {
                let mut cfg = profile.clone();
                cfg.set(&set_args.key, &set_args.value)?;
                config::save_profile(profile_name, &cfg)?;
                output::print_success(&format!("Set {} = {}", set_args.key, set_args.value));
            }
        },
    }

    Ok(())
}

fn make_client(cli: &Cli, profile: &ProfileConfig) -> Result<FhirClient> {
    let server = config::resolve_server(&cli.server, profile)?;
    let auth = cli
        .token
        .clone()
        .or_else(|| profile.token.clone())
        .map(|token| AuthHeader::Bearer { token });
    let client = FhirClient::with_options(
        &server,
        ClientOptions {
            auth,
            timeout: profile.request_timeout(),
        },
    )
    .context("Failed to build HTTP client")?;
    Ok(client)
}

fn show_config(profile_name: &str, cfg: &ProfileConfig) {
    let unset = || "(not set)".to_string();
    println!("{}: {}", "Profile".cyan(), profile_name);
    println!("{}: {}", "Server".cyan(), cfg.server.clone().unwrap_or_else(unset));
    println!("{}: {}", "Format".cyan(), cfg.format.as_deref().unwrap_or("json"));
    println!(
        "{}: {}",
        "Token".cyan(),
        if cfg.token.is_some() { "(set)" } else { "(not set)" }
    );
    let policy = cfg.poll_policy();
    println!("{}: {:?}", "Poll interval".cyan(), policy.interval);
    println!(
        "{}: {}",
        "Max poll attempts".cyan(),
        policy
            .max_attempts
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unlimited".to_string())
    );
    println!(
        "{}: {}",
        "Request timeout".cyan(),
        cfg.request_timeout_secs
            .map(|s| format!("{s}s"))
            .unwrap_or_else(unset)
    );
}
