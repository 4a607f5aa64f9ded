use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use paper_harvest::batch::BatchOptions;
use paper_harvest::domain::{RETRY_REASON_FIELD, RETRY_TIMESTAMP_FIELD, Record};
use paper_harvest::ledger::{self, DEFAULT_LEDGER_NAME};
use paper_harvest::naming::{RETRY_PARTITION, artifact_file_name};
use paper_harvest::probe::{DEFAULT_MIRROR_BASE, Prober};
use paper_harvest::store::OutputStore;
use paper_harvest::transfer::{Transfer, TransferError};
use paper_harvest::worker::Fetcher;

#[derive(Default)]
struct MockTransfer {
    failing: HashSet<String>,
    calls: Mutex<usize>,
}

impl Transfer for MockTransfer {
    fn fetch(
        &self,
        url: &str,
        destination: &Utf8Path,
        _timeout: Duration,
    ) -> Result<(), TransferError> {
        *self.calls.lock().unwrap() += 1;
        let id = url.rsplit('/').next().unwrap_or_default();
        if self.failing.contains(id) {
            return Err(TransferError::Timeout { secs: 1 });
        }
        std::fs::write(destination, b"%PDF-1.4 mock").unwrap();
        Ok(())
    }
}

struct NopProber;

impl Prober for NopProber {
    fn measure(&self, _url: &str) -> Option<Duration> {
        None
    }
}

fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

fn failures(ids: &[&str], origin: &str) -> Vec<Record> {
    ids.iter()
        .map(|id| Record::new(*id).to_failure("mock failure", origin))
        .collect()
}

fn ledger_ids(path: &Utf8Path) -> Vec<String> {
    ledger::load(path)
        .unwrap()
        .map(|ledger| {
            ledger
                .papers
                .iter()
                .filter_map(|record| record.identity().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[test]
fn merge_is_idempotent() {
    let (_temp, root) = scratch();
    let path = root.join(DEFAULT_LEDGER_NAME);
    let batch = failures(&["X", "Y"], "q.json");

    let first = ledger::merge(&path, &batch).unwrap();
    let second = ledger::merge(&path, &batch).unwrap();

    assert_eq!(first.added, 2);
    assert_eq!(second.added, 0);
    assert!(!second.written);
    assert_eq!(ledger_ids(&path), ["X", "Y"]);
}

#[test]
fn sequential_runs_accumulate_each_identity_once() {
    let (_temp, root) = scratch();
    let path = root.join(DEFAULT_LEDGER_NAME);

    ledger::merge(&path, &failures(&["X", "Y"], "run1.json")).unwrap();
    ledger::merge(&path, &failures(&["Y", "Z"], "run2.json")).unwrap();

    let ledger = ledger::load(&path).unwrap().unwrap();
    assert_eq!(ledger_ids(&path), ["X", "Y", "Z"]);
    assert_eq!(ledger.results_count, 3);
    let y = ledger
        .papers
        .iter()
        .find(|record| record.identity() == Some("Y"))
        .unwrap();
    assert_eq!(y.origin(), Some("run1.json"));
}

#[test]
fn identityless_failures_are_kept_once() {
    let (_temp, root) = scratch();
    let path = root.join(DEFAULT_LEDGER_NAME);
    let orphan = Record {
        title: Some("orphan".to_string()),
        ..Record::default()
    }
    .to_failure("missing entry_id", "q.json");

    ledger::merge(&path, std::slice::from_ref(&orphan)).unwrap();
    ledger::merge(&path, std::slice::from_ref(&orphan)).unwrap();

    assert_eq!(ledger::load(&path).unwrap().unwrap().papers.len(), 1);
}

#[test]
fn retry_removes_exactly_the_recovered_entries() {
    let (_temp, root) = scratch();
    let store = OutputStore::new(root.join("out"));
    let path = store.ledger_path(DEFAULT_LEDGER_NAME);
    let origin = root.join("q.json");
    std::fs::write(
        &origin,
        r#"{"query_details":{"keyword":"retry me","category":"cs.NI"},"papers":[]}"#,
    )
    .unwrap();
    ledger::merge(&path, &failures(&["OK1", "BAD", "OK2"], origin.as_str())).unwrap();

    let transfer = MockTransfer {
        failing: HashSet::from(["BAD".to_string()]),
        ..MockTransfer::default()
    };
    let fetcher = Fetcher::new(transfer, NopProber, DEFAULT_MIRROR_BASE);
    let summary =
        ledger::retry_pass(&fetcher, &path, &store, BatchOptions::default(), false).unwrap();

    assert_eq!(summary.attempted, 3);
    assert_eq!(summary.recovered, 2);
    assert_eq!(summary.still_failing, 1);
    assert!(!summary.ledger_removed);
    assert!(store.partition_dir("kw_retry_me_cat_cs.NI").join(artifact_file_name("OK1")).exists());

    let ledger = ledger::load(&path).unwrap().unwrap();
    assert_eq!(ledger_ids(&path), ["BAD"]);
    assert!(ledger.query_details.last_retry_run_timestamp.is_some());
    let bad = &ledger.papers[0];
    assert!(bad.extra_str(RETRY_REASON_FIELD).unwrap().contains("timed out"));
    assert!(bad.extra_str(RETRY_TIMESTAMP_FIELD).is_some());
    assert_eq!(bad.failure_reason(), Some("mock failure"));
}

#[test]
fn fully_recovered_ledger_is_deleted() {
    let (_temp, root) = scratch();
    let store = OutputStore::new(root.join("out"));
    let path = store.ledger_path(DEFAULT_LEDGER_NAME);
    ledger::merge(&path, &failures(&["A", "B"], "/gone/q.json")).unwrap();

    let fetcher = Fetcher::new(MockTransfer::default(), NopProber, DEFAULT_MIRROR_BASE);
    let summary =
        ledger::retry_pass(&fetcher, &path, &store, BatchOptions::default(), true).unwrap();

    assert_eq!(summary.recovered, 2);
    assert!(summary.ledger_removed);
    assert!(!path.exists());
    assert!(store.partition_dir(RETRY_PARTITION).join(artifact_file_name("A")).exists());
}

#[test]
fn retry_with_scan_skips_files_already_present() {
    let (_temp, root) = scratch();
    let store = OutputStore::new(root.join("out"));
    let elsewhere = store.ensure_partition("kw_somewhere").unwrap();
    std::fs::write(elsewhere.join("HAVE.pdf"), b"%PDF-1.4 present").unwrap();
    let path = store.ledger_path(DEFAULT_LEDGER_NAME);
    ledger::merge(&path, &failures(&["HAVE"], "/gone/q.json")).unwrap();

    let fetcher = Fetcher::new(MockTransfer::default(), NopProber, DEFAULT_MIRROR_BASE);
    let summary =
        ledger::retry_pass(&fetcher, &path, &store, BatchOptions::default(), true).unwrap();

    assert_eq!(summary.recovered, 1);
    assert_eq!(*fetcher.transfer().calls.lock().unwrap(), 0);
    assert!(!path.exists());
}

#[test]
fn missing_ledger_is_a_no_op() {
    let (_temp, root) = scratch();
    let store = OutputStore::new(root.join("out"));
    let fetcher = Fetcher::new(MockTransfer::default(), NopProber, DEFAULT_MIRROR_BASE);
    let summary = ledger::retry_pass(
        &fetcher,
        &root.join("absent.json"),
        &store,
        BatchOptions::default(),
        true,
    )
    .unwrap();
    assert_eq!(summary.attempted, 0);
    assert!(!summary.ledger_removed);
}

#[test]
fn corrupt_ledger_aborts_retry() {
    let (_temp, root) = scratch();
    let store = OutputStore::new(root.join("out"));
    let path = root.join("broken.json");
    std::fs::write(&path, "[[[").unwrap();
    let fetcher = Fetcher::new(MockTransfer::default(), NopProber, DEFAULT_MIRROR_BASE);
    assert!(ledger::retry_pass(&fetcher, &path, &store, BatchOptions::default(), false).is_err());
    assert!(path.exists());
}
