use std::collections::HashMap;
use std::fmt;

use crate::error::ConfigError;
use crate::platform::ChatInfo;

/// Canonical identifier of a monitored chat.
///
/// Handles are stored lower-cased without the leading `@`, so `@News`
/// in the config and `news` reported by Telegram resolve to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKey {
    Handle(String),
    Id(i64),
}

impl ChannelKey {
    /// Derive the key for an incoming chat: handle preferred over numeric id.
    pub fn for_chat(chat: &ChatInfo) -> Self {
        match chat.username.as_deref().map(str::trim) {
            Some(handle) if !handle.is_empty() => {
                ChannelKey::Handle(handle.trim_start_matches('@').to_lowercase())
            }
            _ => ChannelKey::Id(chat.id),
        }
    }

    /// Parse a key as written in configuration: `@handle`, `handle` or `id<number>`.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::EmptyChannel);
        }

        if let Some(handle) = raw.strip_prefix('@') {
            return Self::handle(handle)
                .ok_or_else(|| ConfigError::InvalidChannel(raw.to_string()));
        }

        if let Some(id) = raw.strip_prefix("id").and_then(|n| n.parse::<i64>().ok()) {
            return Ok(ChannelKey::Id(id));
        }

        Self::handle(raw).ok_or_else(|| ConfigError::InvalidChannel(raw.to_string()))
    }

    fn handle(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty() && raw.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        valid.then(|| ChannelKey::Handle(raw.to_lowercase()))
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Handle(handle) => write!(f, "@{}", handle),
            ChannelKey::Id(id) => write!(f, "id{}", id),
        }
    }
}

/// Words that must all appear in a message, in any order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseGroup {
    /// Words as configured, used for display
    tokens: Vec<String>,
    /// Lower-cased copies used for matching
    needles: Vec<String>,
}

impl PhraseGroup {
    pub fn new<I, S>(tokens: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens: Vec<String> = tokens.into_iter().map(Into::into).collect();
        if tokens.is_empty() || tokens.iter().any(|t| t.trim().is_empty()) {
            return None;
        }
        let needles = tokens.iter().map(|t| t.to_lowercase()).collect();
        Some(Self { tokens, needles })
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// `lowered` must already be lower-cased.
    pub fn matches(&self, lowered: &str) -> bool {
        self.needles.iter().all(|needle| lowered.contains(needle.as_str()))
    }

    pub fn join(&self, separator: &str) -> String {
        self.tokens.join(separator)
    }
}

/// Per-channel phrase groups, fixed after startup.
///
/// No key ever maps to an empty list; channels without groups are rejected
/// while building.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    channels: HashMap<ChannelKey, Vec<PhraseGroup>>,
}

impl RuleSet {
    pub fn groups(&self, key: &ChannelKey) -> Option<&[PhraseGroup]> {
        self.channels.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.channels.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Channel keys in a stable order, for logging.
    pub fn channel_keys(&self) -> Vec<&ChannelKey> {
        let mut keys: Vec<&ChannelKey> = self.channels.keys().collect();
        keys.sort();
        keys
    }
}

/// Accumulates rules from every configuration source, validating as it goes.
#[derive(Debug, Default)]
pub struct RuleSetBuilder {
    channels: HashMap<ChannelKey, Vec<PhraseGroup>>,
}

impl RuleSetBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add groups for one channel. Repeated channels are appended in order.
    pub fn add<G, T>(&mut self, channel: &str, groups: G) -> Result<&mut Self, ConfigError>
    where
        G: IntoIterator<Item = Vec<T>>,
        T: Into<String>,
    {
        let key = ChannelKey::parse(channel)?;
        let mut parsed = Vec::new();

        for group in groups {
            let tokens: Vec<String> = group
                .into_iter()
                .map(|t| Into::<String>::into(t).trim().to_string())
                .collect();
            if tokens.is_empty() {
                return Err(ConfigError::EmptyGroup {
                    channel: key.to_string(),
                });
            }
            let phrase = PhraseGroup::new(tokens.clone()).ok_or_else(|| ConfigError::EmptyToken {
                channel: key.to_string(),
                group: tokens.join(","),
            })?;
            parsed.push(phrase);
        }

        if parsed.is_empty() {
            return Err(ConfigError::NoGroups(key.to_string()));
        }

        self.channels.entry(key).or_default().extend(parsed);
        Ok(self)
    }

    /// Add one `channel:word1,word2;word3` entry.
    pub fn add_entry(&mut self, entry: &str) -> Result<&mut Self, ConfigError> {
        let (channel, groups) = entry
            .split_once(':')
            .ok_or_else(|| ConfigError::MissingSeparator(entry.trim().to_string()))?;

        let groups: Vec<Vec<&str>> = groups
            .split(';')
            .map(|group| {
                if group.trim().is_empty() {
                    Vec::new()
                } else {
                    group.split(',').collect()
                }
            })
            .collect();

        // A bare "channel:" yields one empty group; report it as a channel without rules.
        if groups.len() == 1 && groups[0].is_empty() {
            return Err(ConfigError::NoGroups(ChannelKey::parse(channel)?.to_string()));
        }

        self.add(channel, groups)
    }

    /// Add newline-separated entries; blank lines and `#` comments are skipped.
    pub fn add_lines(&mut self, text: &str) -> Result<&mut Self, ConfigError> {
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.add_entry(line)?;
        }
        Ok(self)
    }

    pub fn build(self) -> RuleSet {
        RuleSet {
            channels: self.channels,
        }
    }
}
