use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::panic;

use camino::{Utf8Path, Utf8PathBuf};
use lopdf::Document;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::batch;
use crate::domain::{QueryDetails, QueryFile, Record};
use crate::error::HarvestError;
use crate::naming;
use crate::pool;
use crate::probe;
use crate::store::{self, walk_files};

pub const RETRY_LIST_TYPE: &str = "corrupted_pdfs_retry_list";
pub const DEFAULT_LOG_DIR: &str = "corrupted_pdf_logs";
pub const DEFAULT_MIN_SIZE_KB: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Corruption {
    TooSmall { bytes: u64, min_kb: u64 },
    Unparseable { message: String },
    NoPages,
    Unreadable { message: String },
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Corruption::TooSmall { bytes, min_kb } => write!(
                f,
                "file too small ({:.2} KB), below threshold {min_kb} KB",
                *bytes as f64 / 1024.0
            ),
            Corruption::Unparseable { message } => write!(f, "PDF parse error: {message}"),
            Corruption::NoPages => write!(f, "PDF has no pages"),
            Corruption::Unreadable { message } => write!(f, "cannot read file: {message}"),
        }
    }
}

pub fn inspect(path: &Utf8Path, min_size_kb: u64) -> Option<Corruption> {
    let bytes = match fs::metadata(path.as_std_path()) {
        Ok(meta) => meta.len(),
        Err(err) => {
            return Some(Corruption::Unreadable {
                message: err.to_string(),
            });
        }
    };
    if bytes < min_size_kb * 1024 {
        return Some(Corruption::TooSmall {
            bytes,
            min_kb: min_size_kb,
        });
    }

    // lopdf can panic on hostile input; that counts as a parse failure.
    let loaded = panic::catch_unwind(|| Document::load(path.as_std_path()));
    let document = match loaded {
        Ok(Ok(document)) => document,
        Ok(Err(err)) => {
            return Some(Corruption::Unparseable {
                message: err.to_string(),
            });
        }
        Err(payload) => {
            return Some(Corruption::Unparseable {
                message: format!("parser panicked: {}", pool::panic_message(payload)),
            });
        }
    };
    if document.get_pages().is_empty() {
        return Some(Corruption::NoPages);
    }
    None
}

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    pub min_size_kb: u64,
    pub log_dir: Utf8PathBuf,
    pub search_json_dir: Option<Utf8PathBuf>,
    pub dry_run: bool,
    pub mirror_base: String,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            min_size_kb: DEFAULT_MIN_SIZE_KB,
            log_dir: Utf8PathBuf::from(DEFAULT_LOG_DIR),
            search_json_dir: None,
            dry_run: false,
            mirror_base: probe::DEFAULT_MIRROR_BASE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CorruptedPdf {
    pub path: Utf8PathBuf,
    pub relative_path: String,
    pub safe_id: String,
    pub reason: Corruption,
    pub deleted: bool,
    #[serde(skip)]
    pub source: Option<Record>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifySummary {
    pub checked: usize,
    pub corrupted: Vec<CorruptedPdf>,
    pub retry_list: Option<Utf8PathBuf>,
}

impl VerifySummary {
    pub fn deleted(&self) -> usize {
        self.corrupted.iter().filter(|item| item.deleted).count()
    }
}

/// Search-output records keyed by safe identity.
///
/// Filenames only carry the safe identity, so when two identities sanitize
/// to the same stem the first one seen wins.
#[derive(Debug, Default)]
pub struct SearchIndex {
    records: HashMap<String, Record>,
}

impl SearchIndex {
    pub fn build(dir: &Utf8Path) -> Self {
        let mut records = HashMap::new();
        for path in walk_files(dir.as_std_path()) {
            let is_json = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("json"))
                .unwrap_or(false);
            if !is_json {
                continue;
            }
            let Ok(path) = Utf8PathBuf::from_path_buf(path) else {
                continue;
            };
            let file = match QueryFile::load(&path) {
                Ok(file) => file,
                Err(err) => {
                    debug!(path = %path, error = %err, "skipping search file");
                    continue;
                }
            };
            for record in file.papers {
                if let Some(identity) = record.identity() {
                    records
                        .entry(naming::safe_identity(identity))
                        .or_insert(record);
                }
            }
        }
        info!(dir = %dir, records = records.len(), "search output indexed");
        Self { records }
    }

    pub fn find(&self, safe_id: &str) -> Option<&Record> {
        self.records.get(safe_id)
    }
}

pub fn verify_tree(root: &Utf8Path, options: &VerifyOptions) -> Result<VerifySummary, HarvestError> {
    if !root.as_std_path().is_dir() {
        return Err(HarvestError::InvalidInput(format!(
            "{root} is not a directory"
        )));
    }
    let search = options
        .search_json_dir
        .as_deref()
        .filter(|dir| dir.as_std_path().is_dir())
        .map(SearchIndex::build);

    let pdfs: Vec<Utf8PathBuf> = walk_files(root.as_std_path())
        .into_iter()
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case("pdf"))
                .unwrap_or(false)
        })
        .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
        .collect();
    info!(root = %root, files = pdfs.len(), dry_run = options.dry_run, "verifying PDFs");

    let mut summary = VerifySummary {
        checked: pdfs.len(),
        ..VerifySummary::default()
    };
    for path in pdfs {
        let Some(reason) = inspect(&path, options.min_size_kb) else {
            continue;
        };
        warn!(path = %path, "corrupted PDF: {reason}");
        let safe_id = path.file_stem().unwrap_or_default().to_string();
        let relative_path = path
            .strip_prefix(root)
            .map(|rel| rel.to_string())
            .unwrap_or_else(|_| path.to_string());
        let source = search.as_ref().and_then(|index| index.find(&safe_id)).cloned();
        if search.is_some() && source.is_none() {
            warn!(safe_id = %safe_id, "no matching search record found");
        }

        let deleted = if options.dry_run {
            info!(path = %path, "dry run, would delete");
            false
        } else {
            match fs::remove_file(path.as_std_path()) {
                Ok(()) => {
                    info!(path = %path, "deleted corrupted PDF");
                    true
                }
                Err(err) => {
                    error!(path = %path, error = %err, "failed to delete corrupted PDF");
                    false
                }
            }
        };
        summary.corrupted.push(CorruptedPdf {
            path,
            relative_path,
            safe_id,
            reason,
            deleted,
            source,
        });
    }

    if summary.corrupted.is_empty() {
        info!(root = %root, "no corrupted PDFs found");
        return Ok(summary);
    }

    let list = retry_list(root, &summary.corrupted, &options.mirror_base);
    let list_path = options
        .log_dir
        .join(format!("corrupted_pdfs_{}.json", batch::timestamp()));
    store::write_json_atomic(&list_path, &list)?;
    info!(path = %list_path, entries = list.papers.len(), "retry list written");
    summary.retry_list = Some(list_path);
    Ok(summary)
}

pub fn retry_list(root: &Utf8Path, corrupted: &[CorruptedPdf], mirror_base: &str) -> QueryFile {
    let papers: Vec<Record> = corrupted
        .iter()
        .map(|item| {
            let entry_id = item
                .source
                .as_ref()
                .and_then(Record::identity)
                .unwrap_or(item.safe_id.as_str())
                .to_string();
            let title = item
                .source
                .as_ref()
                .and_then(|record| record.title.clone())
                .unwrap_or_else(|| format!("Corrupted PDF: {}", item.safe_id));
            let pdf_url = item
                .source
                .as_ref()
                .and_then(Record::primary_url)
                .map(str::to_string)
                .unwrap_or_else(|| probe::mirror_url(mirror_base, &entry_id));
            let mut record = Record::new(entry_id).with_title(title).with_pdf_url(pdf_url);
            record.extra.insert(
                "original_filepath_when_corrupted".to_string(),
                Value::from(item.path.as_str()),
            );
            record.extra.insert(
                "corruption_reason".to_string(),
                Value::from(item.reason.to_string()),
            );
            record
        })
        .collect();

    let mut query_details = QueryDetails::default();
    query_details
        .extra
        .insert("type".to_string(), Value::from(RETRY_LIST_TYPE));
    query_details.extra.insert(
        "source_pdf_directory_checked".to_string(),
        Value::from(root.as_str()),
    );
    query_details
        .extra
        .insert("timestamp".to_string(), Value::from(batch::timestamp()));
    QueryFile {
        query_details,
        results_count: Some(papers.len()),
        papers,
    }
}
