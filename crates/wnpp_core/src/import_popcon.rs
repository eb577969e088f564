use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use regex::Regex;
use reqwest::blocking::Client;
use rusqlite::Connection;
use tracing::info;

use crate::config::DashboardConfig;
use crate::models::PopconEntry;
use crate::runtime::ResolvedPaths;
use crate::store;

pub const BATCH_SIZE: usize = 500;

const LINE_PATTERN: &str = r"^[0-9]+\s+(?P<name>[^ ]+)\s+(?P<inst>[0-9]+)\s+(?P<vote>[0-9]+)\s+(?P<old>[0-9]+)\s+(?P<recent>[0-9]+)\s+(?P<nofiles>[0-9]+)";

/// Anything that can hand out the raw bytes behind a popcon URL.
pub trait PopconSource {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>>;
}

pub struct HttpPopconSource {
    client: Client,
    user_agent: String,
}

impl HttpPopconSource {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("failed to build popcon HTTP client")?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
        })
    }
}

impl PopconSource for HttpPopconSource {
    fn fetch(&mut self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .header("User-Agent", self.user_agent.clone())
            .send()
            .with_context(|| format!("failed to download {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("download of {url} failed with HTTP {status}");
        }
        let body = response
            .bytes()
            .with_context(|| format!("failed to read body of {url}"))?;
        Ok(body.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopconCategory {
    Source,
    Binary,
}

impl PopconCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Source => "source",
            Self::Binary => "binary",
        }
    }

    pub fn cache_filename(self) -> String {
        format!("popcon_{}_by_inst.gz", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ImportPopconOptions {
    pub source_url: String,
    pub binary_url: String,
    pub maximum_stale: Duration,
    pub download_cache_dir: PathBuf,
}

impl ImportPopconOptions {
    pub fn from_config(config: &DashboardConfig, download_cache_dir: &Path) -> Self {
        Self {
            source_url: config.popcon_source_url(),
            binary_url: config.popcon_binary_url(),
            maximum_stale: Duration::from_secs(config.popcon_stale_hours().saturating_mul(3600)),
            download_cache_dir: download_cache_dir.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PopconCategoryReport {
    pub category: PopconCategory,
    /// Set when the cached download was still fresh.
    pub fresh_until: Option<DateTime<Utc>>,
    pub parsed: usize,
    pub updated: usize,
    pub added: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportPopconReport {
    pub categories: Vec<PopconCategoryReport>,
}

impl ImportPopconReport {
    pub fn nothing_to_do(&self) -> bool {
        self.categories
            .iter()
            .all(|category| category.fresh_until.is_some())
    }
}

/// The counters of one package as published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PopconStats {
    pub inst: i64,
    pub vote: i64,
    pub old: i64,
    pub recent: i64,
    pub nofiles: i64,
}

pub fn import_popcon(
    paths: &ResolvedPaths,
    config: &DashboardConfig,
    options: &ImportPopconOptions,
) -> Result<ImportPopconReport> {
    let mut source = HttpPopconSource::new(&config.user_agent())?;
    let mut connection = store::open_database(paths)?;
    import_popcon_with_source(&mut connection, &mut source, options, SystemTime::now())
}

pub fn import_popcon_with_source<S: PopconSource>(
    connection: &mut Connection,
    source: &mut S,
    options: &ImportPopconOptions,
    now: SystemTime,
) -> Result<ImportPopconReport> {
    let pattern = Regex::new(LINE_PATTERN).context("failed to compile popcon line pattern")?;
    let mut report = ImportPopconReport::default();

    for (url, category) in [
        (options.source_url.as_str(), PopconCategory::Source),
        (options.binary_url.as_str(), PopconCategory::Binary),
    ] {
        let filename = options.download_cache_dir.join(category.cache_filename());
        if let Some(fresh_until) = cached_copy_fresh_until(&filename, options.maximum_stale, now)? {
            let come_back_in = fresh_until
                .duration_since(now)
                .unwrap_or(Duration::ZERO);
            let fresh_until = DateTime::<Utc>::from(fresh_until);
            info!(
                "Nothing to do for {} (hh:mm:ss) more (until {}) for {} packages.",
                format_hh_mm_ss(come_back_in),
                fresh_until.format("%Y-%m-%d %H:%M:%S UTC"),
                category.as_str()
            );
            report.categories.push(PopconCategoryReport {
                category,
                fresh_until: Some(fresh_until),
                parsed: 0,
                updated: 0,
                added: 0,
            });
            continue;
        }

        fs::create_dir_all(&options.download_cache_dir).with_context(|| {
            format!("failed to create {}", options.download_cache_dir.display())
        })?;
        info!("Downloading {url} to file {}...", filename.display());
        let body = source.fetch(url)?;
        fs::write(&filename, &body)
            .with_context(|| format!("failed to write {}", filename.display()))?;

        let category_report = import_from_file(connection, &pattern, &filename, category)?;
        report.categories.push(category_report);
    }

    Ok(report)
}

fn cached_copy_fresh_until(
    filename: &Path,
    maximum_stale: Duration,
    now: SystemTime,
) -> Result<Option<SystemTime>> {
    if !filename.exists() {
        return Ok(None);
    }
    let modified = fs::metadata(filename)
        .and_then(|metadata| metadata.modified())
        .with_context(|| format!("failed to inspect {}", filename.display()))?;
    let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
    if age < maximum_stale {
        return Ok(Some(now + (maximum_stale - age)));
    }
    fs::remove_file(filename)
        .with_context(|| format!("failed to remove stale {}", filename.display()))?;
    Ok(None)
}

fn import_from_file(
    connection: &mut Connection,
    pattern: &Regex,
    filename: &Path,
    category: PopconCategory,
) -> Result<PopconCategoryReport> {
    info!("Importing popcon stats from file {}...", filename.display());
    let compressed =
        fs::read(filename).with_context(|| format!("failed to read {}", filename.display()))?;
    let content = gunzip(&compressed).with_context(|| format!("failed to gunzip {}", filename.display()))?;
    let parsed = parse_popcon_text(pattern, &String::from_utf8_lossy(&content));
    info!("Processing {} entries...", parsed.len());

    let existing = store::load_popcon_entries(connection)?;
    let mut to_update = Vec::new();
    let mut to_add = Vec::new();
    for (package, stats) in &parsed {
        match existing.get(package) {
            Some(entry) => {
                if let Some(merged) = merge_entry(entry, stats) {
                    to_update.push(merged);
                }
            }
            None => to_add.push(new_entry(package, stats)),
        }
    }

    if to_update.is_empty() {
        info!("No stale entries to update.");
    } else {
        info!("Updating {} stale existing entries...", to_update.len());
        write_in_batches(connection, &to_update, "Updating", "update")?;
    }
    if to_add.is_empty() {
        info!("No new entries to add.");
    } else {
        info!("Adding {} new entries...", to_add.len());
        write_in_batches(connection, &to_add, "Adding", "add")?;
    }

    Ok(PopconCategoryReport {
        category,
        fresh_until: None,
        parsed: parsed.len(),
        updated: to_update.len(),
        added: to_add.len(),
    })
}

fn write_in_batches(
    connection: &mut Connection,
    entries: &[PopconEntry],
    verb: &str,
    noun: &str,
) -> Result<()> {
    let mut left = entries.len();
    for batch in entries.chunks(BATCH_SIZE) {
        info!(
            "{verb} next {} entries(s) of {left} left to {noun}...",
            batch.len()
        );
        left -= batch.len();
        let transaction = connection
            .transaction()
            .context("failed to start popcon transaction")?;
        for entry in batch {
            store::upsert_popcon_entry(&transaction, entry)?;
        }
        transaction
            .commit()
            .context("failed to commit popcon transaction")?;
    }
    Ok(())
}

pub fn gunzip(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(compressed);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .context("invalid gzip data")?;
    Ok(output)
}

/// Package counters from a `by_inst` listing; the `Total` line is skipped.
pub fn parse_popcon_text(pattern: &Regex, content: &str) -> BTreeMap<String, PopconStats> {
    let mut output = BTreeMap::new();
    for line in content.split('\n') {
        let Some(captures) = pattern.captures(line.trim_end()) else {
            continue;
        };
        let name = &captures["name"];
        if name == "Total" {
            continue;
        }
        let field = |group: &str| captures[group].parse::<i64>().ok();
        let (Some(inst), Some(vote), Some(old), Some(recent), Some(nofiles)) = (
            field("inst"),
            field("vote"),
            field("old"),
            field("recent"),
            field("nofiles"),
        ) else {
            continue;
        };
        output.insert(
            name.to_string(),
            PopconStats {
                inst,
                vote,
                old,
                recent,
                nofiles,
            },
        );
    }
    output
}

/// Counters never go down: each becomes the larger of the stored and published value.
/// Returns `None` when nothing changed.
pub fn merge_entry(existing: &PopconEntry, stats: &PopconStats) -> Option<PopconEntry> {
    let merge = |old: Option<i64>, new: i64| Some(new.max(old.unwrap_or(0)));
    let merged = PopconEntry {
        package: existing.package.clone(),
        inst: merge(existing.inst, stats.inst),
        vote: merge(existing.vote, stats.vote),
        old: merge(existing.old, stats.old),
        recent: merge(existing.recent, stats.recent),
        nofiles: merge(existing.nofiles, stats.nofiles),
    };
    (merged != *existing).then_some(merged)
}

fn new_entry(package: &str, stats: &PopconStats) -> PopconEntry {
    PopconEntry {
        package: package.to_string(),
        inst: Some(stats.inst),
        vote: Some(stats.vote),
        old: Some(stats.old),
        recent: Some(stats.recent),
        nofiles: Some(stats.nofiles),
    }
}

fn format_hh_mm_ss(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}
