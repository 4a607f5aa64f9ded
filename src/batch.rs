use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::domain::{FetchReport, Outcome, QueryDetails, QueryFile, Record};
use crate::error::HarvestError;
use crate::naming;
use crate::pool;
use crate::probe::Prober;
use crate::store::{self, OutputStore};
use crate::transfer::Transfer;
use crate::worker::{FetchOptions, Fetcher};

pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct Batch {
    pub source: Utf8PathBuf,
    pub query: QueryDetails,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn load(path: &Utf8Path) -> Result<Self, HarvestError> {
        let file = QueryFile::load(path)?;
        Ok(Self {
            source: path.to_path_buf(),
            query: file.query_details,
            records: file.papers,
        })
    }

    pub fn partition(&self) -> String {
        naming::partition_name(
            self.query.keyword(),
            self.query.category(),
            self.source.file_name(),
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub fetch: FetchOptions,
    pub concurrency: usize,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            fetch: FetchOptions::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathDetail {
    pub entry_id: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalDetail {
    pub entry_id: String,
    pub found_at_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedDetail {
    pub entry_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchMetadata {
    pub source_json_file: String,
    pub output_subdirectory_name: String,
    pub query_keyword_used_for_subdir_name: Option<String>,
    pub query_category_used_for_subdir_name: Option<String>,
    pub total_planned: usize,
    pub downloaded_here_count: usize,
    pub existed_in_subdir_count: usize,
    pub skipped_global_duplicate_count: usize,
    pub failed_download_count: usize,
    pub details_downloaded_here: Vec<PathDetail>,
    pub details_existed_subdir: Vec<PathDetail>,
    pub details_skipped_global_duplicates: Vec<GlobalDetail>,
    pub details_failed_downloads: Vec<FailedDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl BatchMetadata {
    fn tally(&mut self, entry_id: &str, outcome: &Outcome) {
        let entry_id = entry_id.to_string();
        match outcome {
            Outcome::Downloaded(path) => {
                self.downloaded_here_count += 1;
                self.details_downloaded_here.push(PathDetail {
                    entry_id,
                    path: path.to_string(),
                });
            }
            Outcome::ExistedSubdir(path) => {
                self.existed_in_subdir_count += 1;
                self.details_existed_subdir.push(PathDetail {
                    entry_id,
                    path: path.to_string(),
                });
            }
            Outcome::ExistedGlobal(path) => {
                self.skipped_global_duplicate_count += 1;
                self.details_skipped_global_duplicates.push(GlobalDetail {
                    entry_id,
                    found_at_path: path.to_string(),
                });
            }
            Outcome::Failed(reason) => {
                self.failed_download_count += 1;
                self.details_failed_downloads.push(FailedDetail {
                    entry_id,
                    reason: reason.clone(),
                });
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub partition: String,
    pub metadata: BatchMetadata,
    pub failures: Vec<Record>,
    pub skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub batches: Vec<BatchReport>,
    pub unreadable: Vec<Utf8PathBuf>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &Record> {
        self.batches.iter().flat_map(|batch| batch.failures.iter())
    }
}

pub fn run_batch<T: Transfer, P: Prober>(
    fetcher: &Fetcher<T, P>,
    batch: &Batch,
    store: &OutputStore,
    options: BatchOptions,
) -> BatchReport {
    let partition = batch.partition();
    let origin = batch.source.as_str();
    let mut metadata = BatchMetadata {
        source_json_file: batch.source.file_name().unwrap_or(origin).to_string(),
        total_planned: batch.records.len(),
        output_subdirectory_name: partition.clone(),
        query_keyword_used_for_subdir_name: batch.query.keyword().map(str::to_string),
        query_category_used_for_subdir_name: batch.query.category().map(str::to_string),
        ..BatchMetadata::default()
    };

    let mut skipped = 0;
    let mut jobs = Vec::with_capacity(batch.records.len());
    for record in &batch.records {
        if record.identity().is_none() {
            warn!(source = %batch.source, title = record.display_title(), "record has no entry_id, skipping");
            skipped += 1;
            continue;
        }
        jobs.push(record);
    }

    info!(
        source = %batch.source,
        partition = %partition,
        planned = jobs.len(),
        workers = options.concurrency,
        policy = %options.fetch.policy,
        "starting batch"
    );

    let destination = match store.ensure_partition(&partition) {
        Ok(dir) => dir,
        Err(err) => {
            error!(partition = %partition, error = %err, "cannot create output directory, batch aborted");
            let reason = format!("cannot create output directory: {err}");
            let failures = jobs
                .iter()
                .map(|record| record.to_failure(&reason, origin))
                .collect();
            metadata.failed_download_count = jobs.len();
            return BatchReport {
                partition,
                metadata,
                failures,
                skipped,
            };
        }
    };

    let mut failures = Vec::new();
    pool::run(
        jobs,
        options.concurrency,
        |record: &&Record| fetcher.fetch(record, &destination, options.fetch),
        |record, result| {
            let report = result.unwrap_or_else(|message| {
                error!(entry_id = record.identity().unwrap_or_default(), "worker fault: {message}");
                FetchReport {
                    entry_id: record.identity().map(str::to_string),
                    outcome: Outcome::Failed(format!("Execution exception: {message}")),
                }
            });
            let entry_id = report.entry_id.as_deref().unwrap_or_default();
            metadata.tally(entry_id, &report.outcome);
            if let Outcome::Failed(reason) = &report.outcome {
                failures.push(record.to_failure(reason, origin));
            }
        },
    );

    metadata.completed_at = Some(Local::now().to_rfc3339());
    let metadata_path = store.metadata_path(&partition);
    if let Err(err) = store::write_json_atomic(&metadata_path, &metadata) {
        error!(path = %metadata_path, error = %err, "failed to write batch metadata");
    }

    info!(
        partition = %partition,
        downloaded = metadata.downloaded_here_count,
        existed_subdir = metadata.existed_in_subdir_count,
        existed_global = metadata.skipped_global_duplicate_count,
        failed = metadata.failed_download_count,
        "batch complete"
    );

    BatchReport {
        partition,
        metadata,
        failures,
        skipped,
    }
}

pub fn run_file<T: Transfer, P: Prober>(
    fetcher: &Fetcher<T, P>,
    path: &Utf8Path,
    store: &OutputStore,
    options: BatchOptions,
) -> Option<BatchReport> {
    match Batch::load(path) {
        Ok(batch) => Some(run_batch(fetcher, &batch, store, options)),
        Err(err) => {
            error!(path = %path, error = %err, "skipping unreadable query file");
            None
        }
    }
}

pub fn list_query_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, HarvestError> {
    let entries = fs::read_dir(dir.as_std_path())
        .map_err(|err| HarvestError::Filesystem(format!("read {dir}: {err}")))?;
    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if !is_json {
            continue;
        }
        match Utf8PathBuf::from_path_buf(path) {
            Ok(path) => files.push(path),
            Err(path) => warn!(path = %path.display(), "skipping non-utf8 query file"),
        }
    }
    files.sort();
    Ok(files)
}

pub fn run_files<T: Transfer, P: Prober>(
    fetcher: &Fetcher<T, P>,
    files: &[Utf8PathBuf],
    store: &OutputStore,
    options: BatchOptions,
    mut on_batch: impl FnMut(&Utf8Path, &BatchReport),
) -> RunReport {
    let mut report = RunReport::default();
    for (index, path) in files.iter().enumerate() {
        info!(file = %path, index = index + 1, total = files.len(), "processing query file");
        match run_file(fetcher, path, store, options) {
            Some(batch) => {
                on_batch(path, &batch);
                report.batches.push(batch);
            }
            None => report.unreadable.push(path.clone()),
        }
    }
    report
}

pub fn run_directory<T: Transfer, P: Prober>(
    fetcher: &Fetcher<T, P>,
    dir: &Utf8Path,
    store: &OutputStore,
    options: BatchOptions,
) -> Result<RunReport, HarvestError> {
    let files = list_query_files(dir)?;
    if files.is_empty() {
        warn!(dir = %dir, "no JSON files found in input directory");
    }
    Ok(run_files(fetcher, &files, store, options, |_, _| {}))
}

pub fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_uses_flat_field_names() {
        let mut metadata = BatchMetadata {
            source_json_file: "q.json".to_string(),
            output_subdirectory_name: "kw_x".to_string(),
            ..BatchMetadata::default()
        };
        metadata.tally("A", &Outcome::Downloaded(Utf8PathBuf::from("/o/kw_x/A.pdf")));
        metadata.tally("B", &Outcome::ExistedGlobal(Utf8PathBuf::from("/o/kw_y/B.pdf")));
        metadata.tally("C", &Outcome::Failed("nope".to_string()));

        let value = serde_json::to_value(&metadata).unwrap();
        assert_eq!(value["downloaded_here_count"], 1);
        assert_eq!(value["skipped_global_duplicate_count"], 1);
        assert_eq!(value["details_skipped_global_duplicates"][0]["found_at_path"], "/o/kw_y/B.pdf");
        assert_eq!(value["details_failed_downloads"][0]["reason"], "nope");
        assert!(value["query_keyword_used_for_subdir_name"].is_null());
    }

    #[test]
    fn batch_partition_falls_back_to_file_name() {
        let batch = Batch {
            source: Utf8PathBuf::from("/in/llm_papers_20240101_101010.json"),
            query: QueryDetails::default(),
            records: Vec::new(),
        };
        assert_eq!(batch.partition(), "llm_papers");
    }
}
