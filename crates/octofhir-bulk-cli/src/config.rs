use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use octofhir_bulk::PollPolicy;
use serde::{Deserialize, Serialize};

use crate::cli::OutputFormat;

pub const VALID_KEYS: &str =
    "server, format, token, poll_interval_secs, max_poll_attempts, request_timeout_secs";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ProfileConfig {
    pub server: Option<String>,
    pub format: Option<String>,
    pub token: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub max_poll_attempts: Option<u32>,
    pub request_timeout_secs: Option<u64>,
}

impl ProfileConfig {
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server" => self.server = Some(value.to_string()),
            "format" => {
                parse_format(value)?;
                self.format = Some(value.to_string());
            }
            "token" => self.token = Some(value.to_string()),
            "poll_interval_secs" => self.poll_interval_secs = Some(parse_number(key, value)?),
            "max_poll_attempts" => self.max_poll_attempts = Some(parse_number(key, value)?),
            "request_timeout_secs" => {
                self.request_timeout_secs = Some(parse_number(key, value)?)
            }
            other => anyhow::bail!("Unknown config key: {other}. Valid keys: {VALID_KEYS}"),
        }
        Ok(())
    }

    pub fn output_format(&self) -> Result<Option<OutputFormat>> {
        self.format.as_deref().map(parse_format).transpose()
    }

    pub fn poll_policy(&self) -> PollPolicy {
        let mut policy = PollPolicy::default();
        if let Some(secs) = self.poll_interval_secs {
            policy = policy.with_interval(Duration::from_secs(secs));
        }
        if let Some(max) = self.max_poll_attempts {
            policy = policy.with_max_attempts(max);
        }
        policy
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid value for {key}: \"{value}\" is not a number"))
}

fn parse_format(value: &str) -> Result<OutputFormat> {
    match value {
        "json" => Ok(OutputFormat::Json),
        "table" => Ok(OutputFormat::Table),
        other => anyhow::bail!("Unknown format: {other}. Valid formats: json, table"),
    }
}

pub type ConfigFile = BTreeMap<String, ProfileConfig>;

fn config_dir() -> Result<PathBuf> {
    let dir = dirs::home_dir()
        .context("Cannot determine home directory")?
        .join(".octofhir-bulk");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn load_all_from(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::new());
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    let cfg: ConfigFile = toml::from_str(&content)
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(cfg)
}

pub fn save_all_to(path: &Path, all: &ConfigFile) -> Result<()> {
    let content = toml::to_string_pretty(all)?;
    fs::write(path, content)?;
    Ok(())
}

pub fn load_profile(profile: &str) -> Result<ProfileConfig> {
    let all = load_all_from(&config_path()?)?;
    Ok(all.get(profile).cloned().unwrap_or_default())
}

pub fn save_profile(profile: &str, config: &ProfileConfig) -> Result<()> {
    let path = config_path()?;
    let mut all = load_all_from(&path)?;
    all.insert(profile.to_string(), config.clone());
    save_all_to(&path, &all)
}

pub fn resolve_server(cli_server: &Option<String>, profile: &ProfileConfig) -> Result<String> {
    // 1. --server flag / OCTOFHIR_URL env
    if let Some(s) = cli_server {
        return Ok(s.clone());
    }
    // 2. config.toml profile
    if let Some(s) = &profile.server {
        return Ok(s.clone());
    }
    anyhow::bail!(
        "No server URL configured. Use --server, set OCTOFHIR_URL env var, or run: octofhir-bulk config set server <url>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_roundtrip_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut cfg = ProfileConfig::default();
        cfg.set("server", "https://example.org/fhir/R4").unwrap();
        cfg.set("poll_interval_secs", "2").unwrap();
        cfg.set("max_poll_attempts", "10").unwrap();

        let mut all = ConfigFile::new();
        all.insert("default".to_string(), cfg.clone());
        save_all_to(&path, &all).unwrap();

        let loaded = load_all_from(&path).unwrap();
        assert_eq!(loaded.get("default"), Some(&cfg));

        let policy = cfg.poll_policy();
        assert_eq!(policy.interval, Duration::from_secs(2));
        assert_eq!(policy.max_attempts, Some(10));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_all_from(&dir.path().join("nope.toml")).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut cfg = ProfileConfig::default();
        assert!(cfg.set("poll_interval_secs", "soon").is_err());
        assert!(cfg.set("format", "yaml").is_err());
        assert!(cfg.set("colour", "red").is_err());
        assert_eq!(cfg, ProfileConfig::default());
    }

    #[test]
    fn test_resolve_server_prefers_flag() {
        let profile = ProfileConfig {
            server: Some("https://profile.example".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_server(&Some("https://flag.example".to_string()), &profile).unwrap(),
            "https://flag.example"
        );
        assert_eq!(resolve_server(&None, &profile).unwrap(), "https://profile.example");
        assert!(resolve_server(&None, &ProfileConfig::default()).is_err());
    }
}
