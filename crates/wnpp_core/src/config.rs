use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pagination::{DEFAULT_ENDING_ITEM_COUNT, DEFAULT_MAX_ITEM_COUNT, PageWindow};

pub const DEFAULT_USER_AGENT: &str = "wnpp/0.3";
pub const DEFAULT_SOAP_URL: &str = "https://bugs.debian.org/cgi-bin/soap.cgi";
pub const DEFAULT_POPCON_BINARY_URL: &str = "https://popcon.debian.org/by_inst.gz";
pub const DEFAULT_POPCON_SOURCE_URL: &str = "https://popcon.debian.org/source/by_inst.gz";
pub const DEFAULT_BIND: &str = "127.0.0.1:8000";
pub const DEFAULT_ISSUES_PER_PAGE: usize = 50;

const DEFAULT_DEBBUGS_BATCH_SIZE: usize = 100;
const DEFAULT_DEBBUGS_STALE_HOURS: u64 = 2;
const DEFAULT_POPCON_STALE_HOURS: u64 = 12;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DashboardConfig {
    #[serde(default)]
    pub debbugs: DebbugsSection,
    #[serde(default)]
    pub popcon: PopconSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub listing: ListingSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DebbugsSection {
    pub soap_url: Option<String>,
    pub user_agent: Option<String>,
    pub batch_size: Option<usize>,
    pub stale_hours: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct PopconSection {
    pub binary_url: Option<String>,
    pub source_url: Option<String>,
    pub stale_hours: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ServerSection {
    pub bind: Option<String>,
    pub static_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ListingSection {
    pub per_page: Option<usize>,
    pub max_item_count: Option<usize>,
    pub ending_item_count: Option<usize>,
}

/// Listing settings after defaults have been applied and the window validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListingSettings {
    pub per_page: usize,
    pub window: PageWindow,
}

impl Default for ListingSettings {
    fn default() -> Self {
        Self {
            per_page: DEFAULT_ISSUES_PER_PAGE,
            window: PageWindow::default(),
        }
    }
}

impl DashboardConfig {
    /// Resolve the SOAP endpoint: env DEBBUGS_SOAP_URL > config > DEFAULT_SOAP_URL.
    pub fn soap_url(&self) -> String {
        env_or("DEBBUGS_SOAP_URL", self.debbugs.soap_url.as_deref())
            .unwrap_or_else(|| DEFAULT_SOAP_URL.to_string())
    }

    /// Resolve user agent: env WNPP_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_or("WNPP_USER_AGENT", self.debbugs.user_agent.as_deref())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn debbugs_batch_size(&self) -> usize {
        self.debbugs
            .batch_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_DEBBUGS_BATCH_SIZE)
    }

    pub fn debbugs_stale_hours(&self) -> u64 {
        self.debbugs
            .stale_hours
            .unwrap_or(DEFAULT_DEBBUGS_STALE_HOURS)
    }

    pub fn popcon_binary_url(&self) -> String {
        self.popcon
            .binary_url
            .clone()
            .unwrap_or_else(|| DEFAULT_POPCON_BINARY_URL.to_string())
    }

    pub fn popcon_source_url(&self) -> String {
        self.popcon
            .source_url
            .clone()
            .unwrap_or_else(|| DEFAULT_POPCON_SOURCE_URL.to_string())
    }

    pub fn popcon_stale_hours(&self) -> u64 {
        self.popcon
            .stale_hours
            .unwrap_or(DEFAULT_POPCON_STALE_HOURS)
    }

    /// Resolve the listen address: env WNPP_BIND > config > DEFAULT_BIND.
    pub fn bind(&self) -> String {
        env_or("WNPP_BIND", self.server.bind.as_deref()).unwrap_or_else(|| DEFAULT_BIND.to_string())
    }

    /// Static directory from config, relative paths resolved against `project_root`.
    pub fn static_dir(&self, project_root: &Path, fallback: &Path) -> PathBuf {
        match self.server.static_dir.as_deref() {
            Some(path) if path.is_absolute() => path.to_path_buf(),
            Some(path) => project_root.join(path),
            None => fallback.to_path_buf(),
        }
    }

    pub fn listing_settings(&self) -> Result<ListingSettings> {
        let per_page = self
            .listing
            .per_page
            .unwrap_or(DEFAULT_ISSUES_PER_PAGE);
        if per_page == 0 {
            anyhow::bail!("[listing] per_page must be at least 1");
        }
        let window = PageWindow::new(
            self.listing.max_item_count.unwrap_or(DEFAULT_MAX_ITEM_COUNT),
            self.listing
                .ending_item_count
                .unwrap_or(DEFAULT_ENDING_ITEM_COUNT),
        )
        .context("invalid [listing] pagination settings")?;
        Ok(ListingSettings { per_page, window })
    }
}

/// Load and parse a DashboardConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<DashboardConfig> {
    if !config_path.exists() {
        return Ok(DashboardConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: DashboardConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_or(key: &str, configured: Option<&str>) -> Option<String> {
    if let Ok(value) = env::var(key) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return Some(trimmed);
        }
    }
    configured.map(str::to_string)
}
