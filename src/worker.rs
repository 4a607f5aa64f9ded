use std::time::Duration;

use camino::Utf8Path;
use tracing::{debug, error, info, warn};

use crate::dedup::{Claim, DedupIndex};
use crate::domain::{FetchReport, Outcome, Record, SourcePolicy};
use crate::naming;
use crate::probe::{self, Prober};
use crate::store;
use crate::transfer::{Transfer, TransferError};

#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub policy: SourcePolicy,
    pub timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            policy: SourcePolicy::Export,
            timeout: Duration::from_secs(300),
        }
    }
}

pub struct Fetcher<T: Transfer, P: Prober> {
    index: DedupIndex,
    transfer: T,
    prober: P,
    mirror_base: String,
}

impl<T: Transfer, P: Prober> Fetcher<T, P> {
    pub fn new(transfer: T, prober: P, mirror_base: impl Into<String>) -> Self {
        Self {
            index: DedupIndex::new(),
            transfer,
            prober,
            mirror_base: mirror_base.into(),
        }
    }

    pub fn index(&self) -> &DedupIndex {
        &self.index
    }

    pub fn transfer(&self) -> &T {
        &self.transfer
    }

    pub fn fetch(
        &self,
        record: &Record,
        destination: &Utf8Path,
        options: FetchOptions,
    ) -> FetchReport {
        let Some(identity) = record.identity() else {
            let reason = format!("missing entry_id, cannot process. title: {}", record.display_title());
            warn!("{reason}");
            return FetchReport {
                entry_id: None,
                outcome: Outcome::Failed(reason),
            };
        };
        let report = |outcome| FetchReport {
            entry_id: Some(identity.to_string()),
            outcome,
        };

        let safe_id = naming::safe_identity(identity);
        let target = destination.join(naming::artifact_file_name(identity));

        let guard = match self.index.claim(&safe_id, &target) {
            Claim::ExistedGlobal(found) => {
                info!(entry_id = identity, found = %found, partition = %destination, "already downloaded elsewhere, skipping");
                return report(Outcome::ExistedGlobal(found));
            }
            Claim::ExistedSubdir(path) => {
                info!(entry_id = identity, path = %path, "already present in partition, skipping");
                return report(Outcome::ExistedSubdir(path));
            }
            Claim::Acquired(guard) => guard,
        };

        let Some(url) = self.resolve_url(identity, record.primary_url(), options.policy) else {
            let reason = format!(
                "cannot determine a download URL for {identity} ({})",
                record.display_title()
            );
            error!(entry_id = identity, "{reason}");
            return report(Outcome::Failed(reason));
        };

        info!(
            entry_id = identity,
            url = %url,
            target = %target,
            timeout_secs = options.timeout.as_secs(),
            "downloading '{}'",
            record.display_title()
        );
        match self.transfer.fetch(&url, &target, options.timeout) {
            Ok(()) => {
                info!(entry_id = identity, path = %target, "download complete");
                guard.complete(&target);
                report(Outcome::Downloaded(target))
            }
            Err(err) => {
                let reason = failure_reason(identity, &url, &err);
                error!(entry_id = identity, "{reason}");
                if !matches!(err, TransferError::MissingTool(_)) && store::remove_file_quiet(&target)
                {
                    debug!(path = %target, "removed partial file");
                }
                drop(guard);
                report(Outcome::Failed(reason))
            }
        }
    }

    fn resolve_url(
        &self,
        identity: &str,
        primary: Option<&str>,
        policy: SourcePolicy,
    ) -> Option<String> {
        match policy {
            SourcePolicy::Primary => Some(
                primary
                    .map(str::to_string)
                    .unwrap_or_else(|| probe::mirror_url(&self.mirror_base, identity)),
            ),
            SourcePolicy::Export => Some(probe::mirror_url(&self.mirror_base, identity)),
            SourcePolicy::Fastest => {
                probe::choose_best_url(&self.prober, identity, primary, &self.mirror_base)
            }
        }
    }
}

fn failure_reason(identity: &str, url: &str, err: &TransferError) -> String {
    match err {
        TransferError::Timeout { secs } => {
            format!("download of {identity} ({url}) timed out ({secs}s)")
        }
        TransferError::Exit {
            program,
            code,
            stderr,
        } => format!("{program} failed for {identity} ({url}). Code: {code}. Stderr: {stderr}"),
        TransferError::MissingTool(_) => err.to_string(),
        TransferError::Io(message) => {
            format!("unexpected error downloading {identity} ({url}): {message}")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;

    use super::*;

    struct MockTransfer {
        result: Result<(), TransferError>,
        calls: Mutex<Vec<String>>,
    }

    impl MockTransfer {
        fn ok() -> Self {
            Self {
                result: Ok(()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn failing(err: TransferError) -> Self {
            Self {
                result: Err(err),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transfer for MockTransfer {
        fn fetch(
            &self,
            url: &str,
            destination: &Utf8Path,
            _timeout: Duration,
        ) -> Result<(), TransferError> {
            self.calls.lock().unwrap().push(url.to_string());
            std::fs::write(destination, b"%PDF-1.4 partial").unwrap();
            self.result.clone()
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

    #[test]
    fn export_policy_uses_mirror() {
        let (_temp, root) = scratch();
        let fetcher = Fetcher::new(MockTransfer::ok(), NopProber, probe::DEFAULT_MIRROR_BASE);
        let record = Record::new("2101.00001").with_pdf_url("https://arxiv.org/pdf/2101.00001");

        let report = fetcher.fetch(&record, &root, FetchOptions::default());
        assert_matches!(report.outcome, Outcome::Downloaded(ref path) if path == &root.join("2101.00001.pdf"));
        assert_eq!(
            fetcher.transfer().calls.lock().unwrap().as_slice(),
            ["https://export.arxiv.org/pdf/2101.00001"]
        );
        assert_eq!(fetcher.index().lookup("2101.00001"), Some(root.join("2101.00001.pdf")));
    }

    #[test]
    fn primary_policy_prefers_record_url() {
        let (_temp, root) = scratch();
        let fetcher = Fetcher::new(MockTransfer::ok(), NopProber, probe::DEFAULT_MIRROR_BASE);
        let options = FetchOptions {
            policy: SourcePolicy::Primary,
            ..FetchOptions::default()
        };
        fetcher.fetch(&Record::new("A").with_pdf_url("https://arxiv.org/pdf/A"), &root, options);
        fetcher.fetch(&Record::new("B"), &root, options);
        assert_eq!(
            fetcher.transfer().calls.lock().unwrap().as_slice(),
            ["https://arxiv.org/pdf/A", "https://export.arxiv.org/pdf/B"]
        );
    }

    #[test]
    fn missing_identity_touches_nothing() {
        let (_temp, root) = scratch();
        let fetcher = Fetcher::new(MockTransfer::ok(), NopProber, probe::DEFAULT_MIRROR_BASE);
        let record = Record {
            title: Some("orphan".to_string()),
            ..Record::default()
        };
        let report = fetcher.fetch(&record, &root, FetchOptions::default());
        assert_eq!(report.entry_id, None);
        assert_matches!(report.outcome, Outcome::Failed(ref reason) if reason.contains("missing entry_id"));
        assert!(fetcher.transfer().calls.lock().unwrap().is_empty());
    }

    #[test]
    fn failure_removes_partial_file() {
        let (_temp, root) = scratch();
        let fetcher = Fetcher::new(
            MockTransfer::failing(TransferError::Exit {
                program: "wget".to_string(),
                code: 8,
                stderr: "ERROR 404".to_string(),
            }),
            NopProber,
            probe::DEFAULT_MIRROR_BASE,
        );
        let report = fetcher.fetch(&Record::new("math/0211159"), &root, FetchOptions::default());
        assert_matches!(report.outcome, Outcome::Failed(ref reason) if reason.contains("Code: 8") && reason.contains("ERROR 404"));
        assert!(!root.join("math_0211159.pdf").exists());
        assert!(fetcher.index().lookup("math_0211159").is_none());
    }

    #[test]
    fn timeout_is_reported_as_failure() {
        let (_temp, root) = scratch();
        let fetcher = Fetcher::new(
            MockTransfer::failing(TransferError::Timeout { secs: 3 }),
            NopProber,
            probe::DEFAULT_MIRROR_BASE,
        );
        let report = fetcher.fetch(&Record::new("T"), &root, FetchOptions::default());
        assert_matches!(report.outcome, Outcome::Failed(ref reason) if reason.contains("timed out"));
        assert!(!root.join("T.pdf").exists());
    }

    #[test]
    fn second_fetch_of_same_identity_is_skipped() {
        let (_temp, root) = scratch();
        let fetcher = Fetcher::new(MockTransfer::ok(), NopProber, probe::DEFAULT_MIRROR_BASE);
        let first = root.join("kw_a");
        let second = root.join("kw_b");
        std::fs::create_dir_all(&first).unwrap();
        std::fs::create_dir_all(&second).unwrap();

        fetcher.fetch(&Record::new("D"), &first, FetchOptions::default());
        let report = fetcher.fetch(&Record::new("D"), &second, FetchOptions::default());
        assert_matches!(report.outcome, Outcome::ExistedGlobal(_));
        assert!(!second.join("D.pdf").exists());
        assert_eq!(fetcher.transfer().calls.lock().unwrap().len(), 1);
    }
}
