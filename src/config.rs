use std::fs;
use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::domain::SourcePolicy;
use crate::error::HarvestError;
use crate::ledger::DEFAULT_LEDGER_NAME;
use crate::probe::{DEFAULT_MIRROR_BASE, ProbeSettings};
use crate::search::SearchSettings;
use crate::transfer::TransferSettings;

pub const DEFAULT_CONFIG_FILE: &str = "paper-harvest.json";
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_WORKERS: usize = 4;

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("valid env reference pattern")
});

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub download_source: Option<SourcePolicy>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub failed_log: Option<String>,
    #[serde(default)]
    pub mirror_base: Option<String>,
    #[serde(default)]
    pub transfer: Option<TransferConfig>,
    #[serde(default)]
    pub probe: Option<ProbeConfig>,
    #[serde(default)]
    pub search: Option<SearchConfig>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TransferConfig {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub tries: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub read_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SearchConfig {
    #[serde(default)]
    pub api_url: Option<String>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub delay_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub download_source: SourcePolicy,
    pub timeout: Duration,
    pub workers: usize,
    pub failed_log: String,
    pub mirror_base: String,
    pub transfer: TransferSettings,
    pub probe: ProbeSettings,
    pub search: SearchSettings,
    pub source: Option<PathBuf>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            download_source: SourcePolicy::Export,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            workers: DEFAULT_WORKERS,
            failed_log: DEFAULT_LEDGER_NAME.to_string(),
            mirror_base: DEFAULT_MIRROR_BASE.to_string(),
            transfer: TransferSettings::default(),
            probe: ProbeSettings::default(),
            search: SearchSettings::default(),
            source: None,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, HarvestError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(ResolvedConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| HarvestError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| HarvestError::ConfigParse(err.to_string()))?;

        let mut resolved = Self::resolve_config(config)?;
        resolved.source = Some(config_path);
        Ok(resolved)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, HarvestError> {
        let defaults = ResolvedConfig::default();

        let workers = config.workers.unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(HarvestError::ConfigParse(
                "workers must be at least 1".to_string(),
            ));
        }
        let timeout_secs = config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(HarvestError::ConfigParse(
                "timeout_secs must be at least 1".to_string(),
            ));
        }
        let failed_log = config
            .failed_log
            .filter(|name| !name.trim().is_empty())
            .unwrap_or(defaults.failed_log);

        let transfer_config = config.transfer.unwrap_or_default();
        let transfer = TransferSettings {
            program: transfer_config
                .program
                .filter(|program| !program.trim().is_empty())
                .unwrap_or(defaults.transfer.program),
            connect_timeout: transfer_config
                .connect_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.transfer.connect_timeout),
            tries: transfer_config.tries.unwrap_or(defaults.transfer.tries),
        };

        let probe_config = config.probe.unwrap_or_default();
        let probe = ProbeSettings {
            timeout: probe_config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.probe.timeout),
            read_bytes: probe_config.read_bytes.unwrap_or(defaults.probe.read_bytes),
        };

        let search_config = config.search.unwrap_or_default();
        let page_size = search_config.page_size.unwrap_or(defaults.search.page_size);
        if page_size == 0 {
            return Err(HarvestError::ConfigParse(
                "search.page_size must be at least 1".to_string(),
            ));
        }
        let search = SearchSettings {
            api_url: search_config
                .api_url
                .filter(|url| !url.trim().is_empty())
                .unwrap_or(defaults.search.api_url),
            page_size,
            delay: search_config
                .delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.search.delay),
            retries: search_config.retries.unwrap_or(defaults.search.retries),
            timeout: search_config
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.search.timeout),
        };

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(1),
            download_source: config.download_source.unwrap_or(defaults.download_source),
            timeout: Duration::from_secs(timeout_secs),
            workers,
            failed_log,
            mirror_base: config.mirror_base.unwrap_or(defaults.mirror_base),
            transfer,
            probe,
            search,
            source: None,
        })
    }
}

pub fn expand_path(input: &str) -> Result<Utf8PathBuf, HarvestError> {
    let expanded = ENV_REFERENCE.replace_all(input, |caps: &Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|name| name.as_str())
            .unwrap_or_default();
        std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
    });

    let rest = if &*expanded == "~" {
        Some("")
    } else {
        expanded
            .strip_prefix("~/")
            .or_else(|| expanded.strip_prefix("~\\"))
    };
    let Some(rest) = rest else {
        return Ok(Utf8PathBuf::from(&*expanded));
    };

    let home = BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| HarvestError::Filesystem("cannot determine home directory".to_string()))?;
    let home = Utf8PathBuf::from_path_buf(home)
        .map_err(|path| HarvestError::NonUtf8Path(path.display().to_string()))?;
    Ok(if rest.is_empty() { home } else { home.join(rest) })
}
