//! Persistent client settings in `~/.transmute/config.toml`.
//!
//! Holds the API URL and the conversion defaults applied when `convert` or
//! `batch submit` leave `--format` or `--quality` out.

use anyhow::{Context, Result};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Set a setting (api-url, output-format, quality)
    Set { key: SettingKey, value: String },

    /// Print one setting
    Get { key: SettingKey },

    /// Show every stored setting
    Show,

    /// Delete the settings file
    Reset {
        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingKey {
    ApiUrl,
    OutputFormat,
    Quality,
}

/// Settings file contents. Unset keys fall back to flags, env and built-in defaults.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<i64>,
}

impl Settings {
    /// Read the settings file; a missing file means no settings.
    pub fn load() -> Result<Self> {
        let path = settings_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn save(&self) -> Result<()> {
        let path = settings_path()?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let text = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))
    }

    fn set(&mut self, key: SettingKey, value: &str) -> Result<()> {
        match key {
            SettingKey::ApiUrl => {
                if !value.starts_with("http://") && !value.starts_with("https://") {
                    anyhow::bail!("api-url must start with http:// or https://");
                }
                self.api_url = Some(value.trim_end_matches('/').to_string());
            }
            SettingKey::OutputFormat => match value.to_ascii_lowercase().as_str() {
                "jpeg" | "jpg" => self.output_format = Some("jpeg".into()),
                "webp" => self.output_format = Some("webp".into()),
                other => anyhow::bail!("output-format must be jpeg or webp, got '{}'", other),
            },
            SettingKey::Quality => {
                let quality: i64 = value
                    .parse()
                    .with_context(|| format!("quality must be a number, got '{}'", value))?;
                if !(0..=100).contains(&quality) {
                    anyhow::bail!("quality must be between 0 and 100");
                }
                self.quality = Some(quality);
            }
        }
        Ok(())
    }

    fn get(&self, key: SettingKey) -> Option<String> {
        match key {
            SettingKey::ApiUrl => self.api_url.clone(),
            SettingKey::OutputFormat => self.output_format.clone(),
            SettingKey::Quality => self.quality.map(|q| q.to_string()),
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn settings_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".transmute").join("config.toml"))
}

fn key_name(key: SettingKey) -> &'static str {
    match key {
        SettingKey::ApiUrl => "api-url",
        SettingKey::OutputFormat => "output-format",
        SettingKey::Quality => "quality",
    }
}

pub async fn execute(cmd: ConfigCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Set { key, value } => {
            let mut settings = Settings::load()?;
            settings.set(key, &value)?;
            settings.save()?;
            let stored = settings.get(key).unwrap_or_default();
            match format {
                OutputFormat::Table => {
                    output::print_success(&format!("{} = {}", key_name(key), stored))
                }
                _ => output::print_item(
                    &serde_json::json!({ "key": key_name(key), "value": stored }),
                    format,
                )?,
            }
        }

        ConfigCommands::Get { key } => {
            let Some(value) = Settings::load()?.get(key) else {
                anyhow::bail!("'{}' is not set", key_name(key));
            };
            match format {
                OutputFormat::Table => println!("{}", value),
                _ => output::print_item(
                    &serde_json::json!({ "key": key_name(key), "value": value }),
                    format,
                )?,
            }
        }

        ConfigCommands::Show => {
            let settings = Settings::load()?;
            if settings.is_empty() {
                output::print_info("No settings stored.");
                return Ok(());
            }
            match format {
                OutputFormat::Table => {
                    output::print_header("Settings");
                    for key in [SettingKey::ApiUrl, SettingKey::OutputFormat, SettingKey::Quality] {
                        if let Some(value) = settings.get(key) {
                            output::print_detail(key_name(key), &value);
                        }
                    }
                }
                _ => output::print_item(&settings, format)?,
            }
        }

        ConfigCommands::Reset { force } => {
            if !force {
                output::print_info("This deletes all stored settings. Use --force to confirm.");
                return Ok(());
            }
            let path = settings_path()?;
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
            output::print_success("Settings cleared");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_use_kebab_case_keys() {
        let settings = Settings {
            api_url: Some("http://localhost:8000".into()),
            output_format: None,
            quality: Some(90),
        };
        let text = toml::to_string_pretty(&settings).unwrap();
        assert!(text.contains("api-url = \"http://localhost:8000\""));
        assert!(!text.contains("output-format"));
        assert_eq!(toml::from_str::<Settings>(&text).unwrap(), settings);
    }

    #[test]
    fn test_set_normalizes_and_validates() {
        let mut settings = Settings::default();
        settings.set(SettingKey::OutputFormat, "JPG").unwrap();
        assert_eq!(settings.output_format.as_deref(), Some("jpeg"));

        settings.set(SettingKey::ApiUrl, "https://transmute.local/").unwrap();
        assert_eq!(settings.api_url.as_deref(), Some("https://transmute.local"));

        assert!(settings.set(SettingKey::OutputFormat, "png").is_err());
        assert!(settings.set(SettingKey::Quality, "101").is_err());
        assert!(settings.set(SettingKey::ApiUrl, "localhost:8000").is_err());
    }
}
