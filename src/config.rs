use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::platform::{SendOptions, TextMode};
use crate::rules::{RuleSet, RuleSetBuilder};

/// Phrase groups keyed by channel, e.g. `{"@news": [["bitcoin", "price"]]}`
pub type ChannelTable = BTreeMap<String, Vec<Vec<String>>>;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub rules: RulesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    /// Chat that receives every alert
    #[serde(default)]
    pub notify_user_id: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifyConfig {
    #[serde(default)]
    pub text_mode: TextMode,
    #[serde(default = "default_true")]
    pub disable_link_preview: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Seconds in-flight handlers may run after shutdown is requested
    #[serde(default = "default_grace_secs")]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RulesConfig {
    /// Inline `channel:word1,word2;word3` entries
    #[serde(default)]
    pub entries: Vec<String>,
    /// Optional file with one entry per line
    #[serde(default)]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub channels: ChannelTable,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("monitor.db")
}

fn default_true() -> bool {
    true
}

fn default_grace_secs() -> u64 {
    10
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            text_mode: TextMode::default(),
            disable_link_preview: default_true(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_secs: default_grace_secs(),
        }
    }
}

impl Config {
    /// Read the TOML file, then apply overrides from the process environment.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::parse(&content)?;
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Apply `BOT_TOKEN`, `NOTIFY_USER_ID` and `CHANNELS_CONFIG` overrides.
    ///
    /// `CHANNELS_CONFIG` is a JSON object in the same shape as `[rules.channels]`
    /// and is merged into it.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = lookup("BOT_TOKEN").filter(|t| !t.trim().is_empty()) {
            self.telegram.bot_token = token.trim().to_string();
        }

        if let Some(id) = lookup("NOTIFY_USER_ID") {
            self.telegram.notify_user_id = id
                .trim()
                .parse()
                .with_context(|| format!("NOTIFY_USER_ID is not an integer: {}", id))?;
        }

        if let Some(json) = lookup("CHANNELS_CONFIG") {
            let table: ChannelTable =
                serde_json::from_str(&json).context("Failed to parse CHANNELS_CONFIG as JSON")?;
            for (channel, groups) in table {
                self.rules.channels.entry(channel).or_default().extend(groups);
            }
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!("telegram.bot_token is not set (config file or BOT_TOKEN)");
        }
        if self.telegram.notify_user_id == 0 {
            anyhow::bail!("telegram.notify_user_id is not set (config file or NOTIFY_USER_ID)");
        }
        Ok(())
    }

    /// Build the rule set from inline entries, the rules file and the channel table.
    pub fn rule_set(&self) -> Result<RuleSet> {
        let mut builder = RuleSetBuilder::new();

        for entry in &self.rules.entries {
            builder.add_entry(entry)?;
        }

        if let Some(file) = &self.rules.file {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read rules file: {}", file.display()))?;
            builder
                .add_lines(&text)
                .with_context(|| format!("Invalid rules file: {}", file.display()))?;
        }

        for (channel, groups) in &self.rules.channels {
            builder.add(channel, groups.iter().cloned())?;
        }

        let rules = builder.build();
        if rules.is_empty() {
            anyhow::bail!("No channels configured; add [rules] entries, a rules file or CHANNELS_CONFIG");
        }
        Ok(rules)
    }

    pub fn send_options(&self) -> SendOptions {
        SendOptions {
            disable_link_preview: self.notify.disable_link_preview,
            text_mode: self.notify.text_mode,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.monitor.shutdown_grace_secs)
    }
}
