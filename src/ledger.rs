use std::collections::{HashMap, HashSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::batch::{self, BatchOptions};
use crate::domain::{FetchReport, Outcome, QueryDetails, QueryFile, Record};
use crate::error::HarvestError;
use crate::naming;
use crate::pool;
use crate::probe::Prober;
use crate::store::{self, OutputStore};
use crate::transfer::Transfer;
use crate::worker::Fetcher;

pub const DEFAULT_LEDGER_NAME: &str = "failed_downloads.json";
pub const LEDGER_TYPE: &str = "accumulated_failed_downloads_log";
const LEDGER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerDetails {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_run_timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerFile {
    #[serde(default)]
    pub query_details: LedgerDetails,
    #[serde(default)]
    pub results_count: usize,
    #[serde(default)]
    pub papers: Vec<Record>,
}

impl LedgerFile {
    fn with_papers(papers: Vec<Record>) -> Self {
        Self {
            query_details: LedgerDetails {
                kind: LEDGER_TYPE.to_string(),
                ..LedgerDetails::default()
            },
            results_count: papers.len(),
            papers,
        }
    }
}

pub fn load(path: &Utf8Path) -> Result<Option<LedgerFile>, HarvestError> {
    if !path.as_std_path().exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path.as_std_path()).map_err(|err| HarvestError::LedgerRead {
        path: path.to_string(),
        message: err.to_string(),
    })?;
    if content.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|err| HarvestError::LedgerParse {
            path: path.to_string(),
            message: err.to_string(),
        })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub total: usize,
    pub written: bool,
}

/// Folds `new_failures` into the ledger at `path`.
///
/// Existing entries win over new ones with the same identity; identity-less
/// failures are appended unless an identical record is already there. The
/// file is only rewritten when something was added or it did not exist yet.
pub fn merge(path: &Utf8Path, new_failures: &[Record]) -> Result<MergeSummary, HarvestError> {
    let existed = path.as_std_path().exists();
    let (details, existing) = match load(path) {
        Ok(Some(ledger)) => (Some(ledger.query_details), ledger.papers),
        Ok(None) => (None, Vec::new()),
        Err(err) => {
            warn!(path = %path, error = %err, "existing ledger unreadable, starting a new one");
            (None, Vec::new())
        }
    };

    let mut known: HashSet<String> = existing
        .iter()
        .filter_map(|record| record.identity().map(str::to_string))
        .collect();
    let mut papers = existing;
    let mut added = 0;
    for failure in new_failures {
        match failure.identity() {
            Some(identity) => {
                if known.insert(identity.to_string()) {
                    papers.push(failure.clone());
                    added += 1;
                }
            }
            None => {
                if !papers.contains(failure) {
                    papers.push(failure.clone());
                    added += 1;
                }
            }
        }
    }

    let total = papers.len();
    if added == 0 && existed {
        info!(path = %path, total, "no new failures to record in ledger");
        return Ok(MergeSummary {
            added,
            total,
            written: false,
        });
    }

    let mut ledger = LedgerFile::with_papers(papers);
    if let Some(details) = details {
        ledger.query_details = LedgerDetails {
            kind: LEDGER_TYPE.to_string(),
            ..details
        };
    }
    ledger.query_details.last_updated_timestamp = Some(ledger_timestamp());
    store::write_json_atomic(path, &ledger)?;
    info!(path = %path, added, total, "failure ledger updated");
    Ok(MergeSummary {
        added,
        total,
        written: true,
    })
}

pub fn prune_if_empty(path: &Utf8Path) -> Result<usize, HarvestError> {
    if !path.as_std_path().exists() {
        return Ok(0);
    }
    let remaining = match load(path) {
        Ok(ledger) => ledger.map(|ledger| ledger.papers.len()).unwrap_or(0),
        Err(err) => {
            warn!(path = %path, error = %err, "ledger unreadable, leaving it in place");
            return Ok(1);
        }
    };
    if remaining == 0 {
        fs::remove_file(path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("remove {path}: {err}")))?;
        info!(path = %path, "removed empty failure ledger");
    }
    Ok(remaining)
}

#[derive(Debug, Default)]
pub struct OriginCache {
    loaded: HashMap<String, Option<QueryDetails>>,
}

impl OriginCache {
    fn details(&mut self, origin: &str) -> Option<&QueryDetails> {
        self.loaded
            .entry(origin.to_string())
            .or_insert_with(|| {
                let path = Utf8Path::new(origin);
                if !path.as_std_path().exists() {
                    return None;
                }
                match QueryFile::load(path) {
                    Ok(file) => Some(file.query_details),
                    Err(err) => {
                        warn!(origin, error = %err, "cannot read originating query file");
                        None
                    }
                }
            })
            .as_ref()
    }
}

pub fn target_partition(record: &Record, origins: &mut OriginCache) -> String {
    let (mut keyword, mut category) = (None, None);
    if let Some(details) = record.origin().and_then(|origin| origins.details(origin)) {
        keyword = details.keyword().map(str::to_string);
        category = details.category().map(str::to_string);
    }
    if keyword.is_none() {
        keyword = record.extra_str("keyword_from_query").map(str::to_string);
    }
    if category.is_none() {
        category = record
            .extra_str("category_from_query")
            .or_else(|| record.extra_str("primary_category"))
            .map(str::to_string);
    }
    naming::facet_partition(keyword.as_deref(), category.as_deref())
        .unwrap_or_else(|| naming::RETRY_PARTITION.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct RetrySummary {
    pub ledger: Utf8PathBuf,
    pub attempted: usize,
    pub recovered: usize,
    pub still_failing: usize,
    pub kept_unprocessed: usize,
    pub ledger_removed: bool,
}

pub fn retry_pass<T: Transfer, P: Prober>(
    fetcher: &Fetcher<T, P>,
    ledger_path: &Utf8Path,
    store: &OutputStore,
    options: BatchOptions,
    use_global_scan: bool,
) -> Result<RetrySummary, HarvestError> {
    let mut summary = RetrySummary {
        ledger: ledger_path.to_path_buf(),
        ..RetrySummary::default()
    };
    let Some(mut ledger) = load(ledger_path)? else {
        info!(path = %ledger_path, "failure ledger missing or empty, nothing to retry");
        return Ok(summary);
    };
    if ledger.papers.is_empty() {
        info!(path = %ledger_path, "failure ledger has no entries, nothing to retry");
        return Ok(summary);
    }

    if use_global_scan {
        fetcher.index().scan_all(store.root());
    }

    info!(path = %ledger_path, entries = ledger.papers.len(), "starting retry pass");
    let mut origins = OriginCache::default();
    let mut kept: Vec<(usize, Record)> = Vec::new();
    let mut jobs: Vec<(usize, Record, Utf8PathBuf)> = Vec::new();
    for (position, record) in std::mem::take(&mut ledger.papers).into_iter().enumerate() {
        if record.identity().is_none() {
            warn!(title = record.display_title(), "ledger entry has no entry_id, keeping it");
            kept.push((position, record));
            continue;
        }
        let partition = target_partition(&record, &mut origins);
        match store.ensure_partition(&partition) {
            Ok(dir) => jobs.push((position, record, dir)),
            Err(err) => {
                error!(partition = %partition, error = %err, "cannot create retry directory, keeping entry");
                kept.push((position, record));
            }
        }
    }
    summary.kept_unprocessed = kept.len();
    summary.attempted = jobs.len();

    let run_timestamp = batch::timestamp();
    pool::run(
        jobs,
        options.concurrency,
        |(_, record, dir): &(usize, Record, Utf8PathBuf)| fetcher.fetch(record, dir, options.fetch),
        |(position, mut record, _), result| {
            let report = result.unwrap_or_else(|message| FetchReport {
                entry_id: record.identity().map(str::to_string),
                outcome: Outcome::Failed(format!("Execution exception: {message}")),
            });
            match report.outcome {
                Outcome::Failed(reason) => {
                    warn!(entry_id = record.identity().unwrap_or_default(), "retry failed: {reason}");
                    record.mark_retry_failed(&reason, &run_timestamp);
                    summary.still_failing += 1;
                    kept.push((position, record));
                }
                outcome => {
                    info!(
                        entry_id = record.identity().unwrap_or_default(),
                        outcome = %outcome.kind(),
                        path = outcome.detail(),
                        "retry succeeded"
                    );
                    summary.recovered += 1;
                }
            }
        },
    );

    kept.sort_by_key(|(position, _)| *position);
    let remaining: Vec<Record> = kept.into_iter().map(|(_, record)| record).collect();
    if remaining.is_empty() {
        fs::remove_file(ledger_path.as_std_path())
            .map_err(|err| HarvestError::Filesystem(format!("remove {ledger_path}: {err}")))?;
        summary.ledger_removed = true;
        info!(path = %ledger_path, recovered = summary.recovered, "all entries recovered, ledger removed");
    } else {
        let mut rewritten = LedgerFile::with_papers(remaining);
        rewritten.query_details.extra = ledger.query_details.extra;
        rewritten.query_details.last_updated_timestamp = ledger.query_details.last_updated_timestamp;
        rewritten.query_details.last_retry_run_timestamp = Some(ledger_timestamp());
        store::write_json_atomic(ledger_path, &rewritten)?;
        info!(
            path = %ledger_path,
            recovered = summary.recovered,
            remaining = rewritten.results_count,
            "ledger rewritten with remaining failures"
        );
    }
    Ok(summary)
}

fn ledger_timestamp() -> String {
    Local::now().format(LEDGER_TIME_FORMAT).to_string()
}
