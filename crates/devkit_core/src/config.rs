use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_USER_AGENT: &str = "devkit/0.2";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_CONFIGURATION: &str = "Debug";
pub const DEFAULT_SYNC_RETRIES: u32 = 3;
pub const DEFAULT_SYNC_WAIT_SECONDS: u32 = 5;
pub const DEFAULT_CHANGELOG_TITLE: &str = "Changelog";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DevkitConfig {
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub build: BuildSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub github: GitHubSection,
    #[serde(default)]
    pub changelog: ChangelogSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ToolsSection {
    pub seven_zip: Option<String>,
    pub devenv: Option<String>,
    pub robocopy: Option<String>,
    pub vswhere: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct BuildSection {
    pub solution: Option<String>,
    pub configuration: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SyncSection {
    pub retries: Option<u32>,
    pub wait_seconds: Option<u32>,
    pub threads: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct GitHubSection {
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub api_url: Option<String>,
    pub user_agent: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ChangelogSection {
    pub output: Option<String>,
    pub title: Option<String>,
    #[serde(default)]
    pub exclude_labels: Vec<String>,
    #[serde(default)]
    pub include_open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKind {
    Path,
    Text,
    Number,
}

/// Every setting that `devkit settings` can set or unset. `PROMPTED` is the
/// subset asked for by `devkit settings prompt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SettingKey {
    SevenZip,
    Devenv,
    Robocopy,
    Vswhere,
    Solution,
    Configuration,
    Platform,
    SyncRetries,
    SyncWaitSeconds,
    SyncThreads,
    GitHubOwner,
    GitHubRepo,
    GitHubApiUrl,
    GitHubUserAgent,
    ChangelogOutput,
    ChangelogTitle,
}

impl SettingKey {
    pub const ALL: [SettingKey; 16] = [
        Self::SevenZip,
        Self::Devenv,
        Self::Robocopy,
        Self::Vswhere,
        Self::Solution,
        Self::Configuration,
        Self::Platform,
        Self::SyncRetries,
        Self::SyncWaitSeconds,
        Self::SyncThreads,
        Self::GitHubOwner,
        Self::GitHubRepo,
        Self::GitHubApiUrl,
        Self::GitHubUserAgent,
        Self::ChangelogOutput,
        Self::ChangelogTitle,
    ];

    pub const PROMPTED: [SettingKey; 13] = [
        Self::SevenZip,
        Self::Devenv,
        Self::Robocopy,
        Self::Solution,
        Self::Configuration,
        Self::Platform,
        Self::SyncRetries,
        Self::SyncWaitSeconds,
        Self::SyncThreads,
        Self::GitHubOwner,
        Self::GitHubRepo,
        Self::ChangelogOutput,
        Self::ChangelogTitle,
    ];

    pub fn parse(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|key| key.name() == normalized)
            .ok_or_else(|| {
                let known = Self::ALL
                    .iter()
                    .map(|key| key.name())
                    .collect::<Vec<_>>()
                    .join(", ");
                anyhow::anyhow!("unknown setting: {value} (expected one of: {known})")
            })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::SevenZip => "tools.seven_zip",
            Self::Devenv => "tools.devenv",
            Self::Robocopy => "tools.robocopy",
            Self::Vswhere => "tools.vswhere",
            Self::Solution => "build.solution",
            Self::Configuration => "build.configuration",
            Self::Platform => "build.platform",
            Self::SyncRetries => "sync.retries",
            Self::SyncWaitSeconds => "sync.wait_seconds",
            Self::SyncThreads => "sync.threads",
            Self::GitHubOwner => "github.owner",
            Self::GitHubRepo => "github.repo",
            Self::GitHubApiUrl => "github.api_url",
            Self::GitHubUserAgent => "github.user_agent",
            Self::ChangelogOutput => "changelog.output",
            Self::ChangelogTitle => "changelog.title",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::SevenZip => "Path to 7z.exe",
            Self::Devenv => "Path to devenv.com",
            Self::Robocopy => "Path to robocopy.exe",
            Self::Vswhere => "Path to vswhere.exe",
            Self::Solution => "Solution file",
            Self::Configuration => "Build configuration",
            Self::Platform => "Build platform",
            Self::SyncRetries => "Robocopy retries",
            Self::SyncWaitSeconds => "Robocopy wait between retries (seconds)",
            Self::SyncThreads => "Robocopy threads",
            Self::GitHubOwner => "GitHub owner",
            Self::GitHubRepo => "GitHub repository",
            Self::GitHubApiUrl => "GitHub API URL",
            Self::GitHubUserAgent => "GitHub user agent",
            Self::ChangelogOutput => "Changelog output file",
            Self::ChangelogTitle => "Changelog title",
        }
    }

    pub fn kind(self) -> SettingKind {
        match self {
            Self::SevenZip | Self::Devenv | Self::Robocopy | Self::Vswhere | Self::Solution => {
                SettingKind::Path
            }
            Self::SyncRetries | Self::SyncWaitSeconds | Self::SyncThreads => SettingKind::Number,
            _ => SettingKind::Text,
        }
    }

    pub fn default_value(self) -> Option<String> {
        match self {
            Self::Configuration => Some(DEFAULT_CONFIGURATION.to_string()),
            Self::SyncRetries => Some(DEFAULT_SYNC_RETRIES.to_string()),
            Self::SyncWaitSeconds => Some(DEFAULT_SYNC_WAIT_SECONDS.to_string()),
            Self::ChangelogTitle => Some(DEFAULT_CHANGELOG_TITLE.to_string()),
            _ => None,
        }
    }

    fn split(self) -> (&'static str, &'static str) {
        self.name()
            .split_once('.')
            .unwrap_or(("", self.name()))
    }
}

impl DevkitConfig {
    pub fn get(&self, key: SettingKey) -> Option<String> {
        match key {
            SettingKey::SevenZip => self.tools.seven_zip.clone(),
            SettingKey::Devenv => self.tools.devenv.clone(),
            SettingKey::Robocopy => self.tools.robocopy.clone(),
            SettingKey::Vswhere => self.tools.vswhere.clone(),
            SettingKey::Solution => self.build.solution.clone(),
            SettingKey::Configuration => self.build.configuration.clone(),
            SettingKey::Platform => self.build.platform.clone(),
            SettingKey::SyncRetries => self.sync.retries.map(|value| value.to_string()),
            SettingKey::SyncWaitSeconds => self.sync.wait_seconds.map(|value| value.to_string()),
            SettingKey::SyncThreads => self.sync.threads.map(|value| value.to_string()),
            SettingKey::GitHubOwner => self.github.owner.clone(),
            SettingKey::GitHubRepo => self.github.repo.clone(),
            SettingKey::GitHubApiUrl => self.github.api_url.clone(),
            SettingKey::GitHubUserAgent => self.github.user_agent.clone(),
            SettingKey::ChangelogOutput => self.changelog.output.clone(),
            SettingKey::ChangelogTitle => self.changelog.title.clone(),
        }
        .filter(|value| !value.trim().is_empty())
    }

    pub fn configuration(&self) -> String {
        self.get(SettingKey::Configuration)
            .unwrap_or_else(|| DEFAULT_CONFIGURATION.to_string())
    }

    pub fn sync_retries(&self) -> u32 {
        self.sync.retries.unwrap_or(DEFAULT_SYNC_RETRIES)
    }

    pub fn sync_wait_seconds(&self) -> u32 {
        self.sync.wait_seconds.unwrap_or(DEFAULT_SYNC_WAIT_SECONDS)
    }

    pub fn changelog_title(&self) -> String {
        self.get(SettingKey::ChangelogTitle)
            .unwrap_or_else(|| DEFAULT_CHANGELOG_TITLE.to_string())
    }

    /// Resolve the GitHub token: env DEVKIT_GITHUB_TOKEN > env GITHUB_TOKEN > config.
    pub fn github_token(&self) -> Option<String> {
        self.github_token_with_lookup(|key| env::var(key).ok())
    }

    fn github_token_with_lookup<F>(&self, lookup_env: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in ["DEVKIT_GITHUB_TOKEN", "GITHUB_TOKEN"] {
            if let Some(value) = lookup_env(key) {
                let trimmed = value.trim().to_string();
                if !trimmed.is_empty() {
                    return Some(trimmed);
                }
            }
        }
        self.github
            .token
            .clone()
            .filter(|value| !value.trim().is_empty())
    }

    /// Resolve the GitHub API root: env DEVKIT_GITHUB_API_URL > config > DEFAULT_GITHUB_API_URL.
    pub fn github_api_url(&self) -> String {
        if let Ok(value) = env::var("DEVKIT_GITHUB_API_URL") {
            let trimmed = value.trim().trim_end_matches('/').to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.github
            .api_url
            .as_deref()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_GITHUB_API_URL.to_string())
    }

    /// Resolve user agent: env DEVKIT_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        if let Ok(value) = env::var("DEVKIT_USER_AGENT") {
            let trimmed = value.trim().to_string();
            if !trimmed.is_empty() {
                return trimmed;
            }
        }
        self.github
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }
}

/// Load and parse a DevkitConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<DevkitConfig> {
    if !config_path.exists() {
        return Ok(DevkitConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: DevkitConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

/// Ordered setting changes. `None` removes the key from the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigPatch {
    pub entries: Vec<(SettingKey, Option<String>)>,
}

impl ConfigPatch {
    pub fn set(&mut self, key: SettingKey, value: impl Into<String>) {
        self.entries.push((key, Some(value.into())));
    }

    pub fn unset(&mut self, key: SettingKey) {
        self.entries.push((key, None));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Update selected keys while preserving all other config sections.
/// Returns `true` when a write occurred.
pub fn patch_config(config_path: &Path, patch: &ConfigPatch) -> Result<bool> {
    if patch.is_empty() {
        return Ok(false);
    }

    let mut root = if config_path.exists() {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        toml::from_str::<Value>(&content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?
    } else {
        Value::Table(Default::default())
    };
    let original = root.clone();

    let root_table = root.as_table_mut().ok_or_else(|| {
        anyhow::anyhow!(
            "top-level TOML must be a table in {}",
            config_path.display()
        )
    })?;

    for (key, value) in &patch.entries {
        let (section, field) = key.split();
        let section_entry = root_table
            .entry(section.to_string())
            .or_insert_with(|| Value::Table(Default::default()));
        let section_table = section_entry.as_table_mut().ok_or_else(|| {
            anyhow::anyhow!("[{section}] must be a table in {}", config_path.display())
        })?;
        match value {
            Some(value) => {
                section_table.insert(field.to_string(), setting_value(*key, value)?);
            }
            None => {
                section_table.remove(field);
            }
        }
    }

    if root == original {
        return Ok(false);
    }

    let parent = config_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("config path has no parent: {}", config_path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let rendered = toml::to_string_pretty(&root).context("failed to serialize settings TOML")?;
    fs::write(config_path, rendered)
        .with_context(|| format!("failed to write {}", config_path.display()))?;
    Ok(true)
}

pub fn validate_setting(key: SettingKey, value: &str) -> Result<()> {
    setting_value(key, value).map(|_| ())
}

fn setting_value(key: SettingKey, value: &str) -> Result<Value> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("{} cannot be empty", key.name());
    }
    match key.kind() {
        SettingKind::Number => {
            let parsed = trimmed
                .parse::<u32>()
                .with_context(|| format!("{} must be a non-negative integer", key.name()))?;
            Ok(Value::Integer(i64::from(parsed)))
        }
        SettingKind::Path => Ok(Value::String(trimmed.replace('\\', "/"))),
        SettingKind::Text => Ok(Value::String(trimmed.to_string())),
    }
}
