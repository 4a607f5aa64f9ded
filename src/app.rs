use std::time::{Duration, Instant};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::batch::{self, BatchOptions, BatchReport, RunReport};
use crate::error::HarvestError;
use crate::ledger;
use crate::probe::Prober;
use crate::search::{self, FeedClient, SearchReport, SearchRequest, SearchSettings};
use crate::store::OutputStore;
use crate::transfer::Transfer;
use crate::verify::{self, VerifyOptions, VerifySummary};
use crate::worker::Fetcher;

#[derive(Debug, Clone)]
pub enum DownloadInput {
    File(Utf8PathBuf),
    Directory(Utf8PathBuf),
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub batch: BatchOptions,
    pub failed_log: String,
    pub global_dedup: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryOptions {
    pub batch: BatchOptions,
    pub global_dedup: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutcomeTotals {
    pub planned: usize,
    pub downloaded: usize,
    pub existed_subdir: usize,
    pub existed_global: usize,
    pub failed: usize,
    pub skipped_without_id: usize,
}

impl OutcomeTotals {
    fn add(&mut self, batch: &BatchReport) {
        let metadata = &batch.metadata;
        self.planned += metadata.total_planned;
        self.downloaded += metadata.downloaded_here_count;
        self.existed_subdir += metadata.existed_in_subdir_count;
        self.existed_global += metadata.skipped_global_duplicate_count;
        self.failed += metadata.failed_download_count;
        self.skipped_without_id += batch.skipped;
    }

    pub fn succeeded(&self) -> usize {
        self.downloaded + self.existed_subdir + self.existed_global
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub source: String,
    pub partition: String,
    pub totals: OutcomeTotals,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub output_dir: String,
    pub batches: Vec<BatchSummary>,
    pub unreadable_inputs: Vec<String>,
    pub totals: OutcomeTotals,
    pub ledger: Option<String>,
    pub ledger_entries: usize,
    pub new_ledger_entries: usize,
}

impl DownloadResult {
    pub fn nothing_succeeded(&self) -> bool {
        self.totals.failed > 0 && self.totals.succeeded() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryResult {
    pub ledger: String,
    pub attempted: usize,
    pub recovered: usize,
    pub still_failing: usize,
    pub kept_unprocessed: usize,
    pub ledger_removed: bool,
}

impl RetryResult {
    pub fn nothing_succeeded(&self) -> bool {
        self.attempted > 0 && self.recovered == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub root: String,
    pub dry_run: bool,
    #[serde(flatten)]
    pub summary: VerifySummary,
    pub deleted: usize,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<T: Transfer, P: Prober> {
    store: OutputStore,
    fetcher: Fetcher<T, P>,
}

impl<T: Transfer, P: Prober> App<T, P> {
    pub fn new(store: OutputStore, transfer: T, prober: P, mirror_base: impl Into<String>) -> Self {
        Self {
            store,
            fetcher: Fetcher::new(transfer, prober, mirror_base),
        }
    }

    pub fn store(&self) -> &OutputStore {
        &self.store
    }

    pub fn fetcher(&self) -> &Fetcher<T, P> {
        &self.fetcher
    }

    pub fn download(
        &self,
        input: DownloadInput,
        options: DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<DownloadResult, HarvestError> {
        let started = Instant::now();
        self.store.ensure_root()?;
        self.scan_if(options.global_dedup, sink);

        let mut unreadable_inputs = Vec::new();
        let files = match &input {
            DownloadInput::File(path) if path.as_std_path().is_file() => vec![path.clone()],
            DownloadInput::File(path) => {
                error!(path = %path, "input JSON file not found");
                unreadable_inputs.push(path.to_string());
                Vec::new()
            }
            DownloadInput::Directory(dir) if !dir.as_std_path().is_dir() => {
                error!(dir = %dir, "input directory not found");
                unreadable_inputs.push(dir.to_string());
                Vec::new()
            }
            DownloadInput::Directory(dir) => match batch::list_query_files(dir) {
                Ok(files) => {
                    if files.is_empty() {
                        warn!(dir = %dir, "no JSON files found in input directory");
                    }
                    files
                }
                Err(err) => {
                    error!(dir = %dir, error = %err, "cannot list input directory");
                    unreadable_inputs.push(dir.to_string());
                    Vec::new()
                }
            },
        };

        let run = batch::run_files(
            &self.fetcher,
            &files,
            &self.store,
            options.batch,
            |path, report| {
                sink.event(ProgressEvent {
                    message: format!(
                        "phase=Batch; {} -> {} ({} failed of {})",
                        path, report.partition, report.metadata.failed_download_count,
                        report.metadata.total_planned
                    ),
                    elapsed: Some(started.elapsed()),
                });
            },
        );

        let (ledger, ledger_entries, new_ledger_entries) =
            self.settle_ledger(&run, &options.failed_log, sink);
        let mut totals = OutcomeTotals::default();
        let batches = run
            .batches
            .iter()
            .map(|report| {
                totals.add(report);
                let mut batch_totals = OutcomeTotals::default();
                batch_totals.add(report);
                BatchSummary {
                    source: report.metadata.source_json_file.clone(),
                    partition: report.partition.clone(),
                    totals: batch_totals,
                }
            })
            .collect();

        unreadable_inputs.extend(run.unreadable.iter().map(|path| path.to_string()));
        info!(
            files = files.len(),
            planned = totals.planned,
            failed = totals.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "download run complete"
        );
        Ok(DownloadResult {
            output_dir: self.store.root().to_string(),
            batches,
            unreadable_inputs,
            totals,
            ledger,
            ledger_entries,
            new_ledger_entries,
        })
    }

    pub fn retry(
        &self,
        ledger_path: &Utf8Path,
        options: RetryOptions,
        sink: &dyn ProgressSink,
    ) -> Result<RetryResult, HarvestError> {
        let started = Instant::now();
        self.store.ensure_root()?;
        sink.event(ProgressEvent {
            message: format!("phase=Retry; {ledger_path}"),
            elapsed: None,
        });
        if options.global_dedup {
            sink.event(ProgressEvent {
                message: format!("phase=Scan; {}", self.store.root()),
                elapsed: None,
            });
        }
        let summary = ledger::retry_pass(
            &self.fetcher,
            ledger_path,
            &self.store,
            options.batch,
            options.global_dedup,
        )?;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Retry; recovered {} of {}",
                summary.recovered, summary.attempted
            ),
            elapsed: Some(started.elapsed()),
        });
        Ok(RetryResult {
            ledger: summary.ledger.to_string(),
            attempted: summary.attempted,
            recovered: summary.recovered,
            still_failing: summary.still_failing,
            kept_unprocessed: summary.kept_unprocessed,
            ledger_removed: summary.ledger_removed,
        })
    }

    fn scan_if(&self, enabled: bool, sink: &dyn ProgressSink) {
        if !enabled {
            return;
        }
        let started = Instant::now();
        let found = self.fetcher.index().scan_all(self.store.root());
        sink.event(ProgressEvent {
            message: format!("phase=Scan; {found} existing PDFs indexed"),
            elapsed: Some(started.elapsed()),
        });
    }

    // Merge new failures, or tidy up an empty ledger when there were none.
    fn settle_ledger(
        &self,
        run: &RunReport,
        failed_log: &str,
        sink: &dyn ProgressSink,
    ) -> (Option<String>, usize, usize) {
        let path = self.store.ledger_path(failed_log);
        let failures: Vec<_> = run.failures().cloned().collect();
        sink.event(ProgressEvent {
            message: format!("phase=Ledger; {} new failures", failures.len()),
            elapsed: None,
        });

        if !failures.is_empty() {
            return match ledger::merge(&path, &failures) {
                Ok(summary) => (Some(path.to_string()), summary.total, summary.added),
                Err(err) => {
                    error!(path = %path, error = %err, "failed to update failure ledger");
                    (None, 0, 0)
                }
            };
        }

        match ledger::prune_if_empty(&path) {
            Ok(0) => (None, 0, 0),
            Ok(remaining) => {
                info!(path = %path, remaining, "no new failures; ledger still has entries, run retry");
                (Some(path.to_string()), remaining, 0)
            }
            Err(err) => {
                warn!(path = %path, error = %err, "could not tidy failure ledger");
                (Some(path.to_string()), 0, 0)
            }
        }
    }
}

pub fn verify(
    root: &Utf8Path,
    options: &VerifyOptions,
    sink: &dyn ProgressSink,
) -> Result<VerifyResult, HarvestError> {
    let started = Instant::now();
    sink.event(ProgressEvent {
        message: format!("phase=Verify; {root}"),
        elapsed: None,
    });
    let summary = verify::verify_tree(root, options)?;
    sink.event(ProgressEvent {
        message: format!(
            "phase=Verify; {} corrupted of {}",
            summary.corrupted.len(),
            summary.checked
        ),
        elapsed: Some(started.elapsed()),
    });
    Ok(VerifyResult {
        root: root.to_string(),
        dry_run: options.dry_run,
        deleted: summary.deleted(),
        summary,
    })
}

pub fn search<C: FeedClient + ?Sized>(
    client: &C,
    request: &SearchRequest,
    settings: &SearchSettings,
    json_dir: &Utf8Path,
    file_name: Option<&str>,
    sink: &dyn ProgressSink,
) -> Result<SearchReport, HarvestError> {
    let started = Instant::now();
    sink.event(ProgressEvent {
        message: format!("phase=Search; {}", request.query()),
        elapsed: None,
    });
    let report = search::run_search(client, request, settings, json_dir, file_name)?;
    sink.event(ProgressEvent {
        message: format!(
            "phase=Search; {} papers written to {}",
            report.results_count, report.output
        ),
        elapsed: Some(started.elapsed()),
    });
    Ok(report)
}
