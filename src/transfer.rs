use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camino::Utf8Path;
use thiserror::Error;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("{program} exited with code {code}: {stderr}")]
    Exit {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("{0} command not found; install it and make sure it is on PATH")]
    MissingTool(String),

    #[error("transfer io error: {0}")]
    Io(String),
}

pub trait Transfer: Send + Sync {
    fn fetch(&self, url: &str, destination: &Utf8Path, timeout: Duration)
    -> Result<(), TransferError>;
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub program: String,
    pub connect_timeout: Duration,
    pub tries: u32,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            program: "wget".to_string(),
            connect_timeout: Duration::from_secs(60),
            tries: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WgetTransfer {
    settings: TransferSettings,
}

impl WgetTransfer {
    pub fn new(settings: TransferSettings) -> Self {
        Self { settings }
    }

    pub fn program(&self) -> &str {
        &self.settings.program
    }

    pub fn locate(&self) -> Option<PathBuf> {
        let program = Path::new(&self.settings.program);
        if program.components().count() > 1 {
            return program.exists().then(|| program.to_path_buf());
        }
        find_in_path(&self.settings.program)
    }

    fn args(&self, url: &str, destination: &Utf8Path) -> Vec<String> {
        vec![
            "-O".to_string(),
            destination.to_string(),
            "-c".to_string(),
            "-q".to_string(),
            format!("--timeout={}", self.settings.connect_timeout.as_secs()),
            format!("--tries={}", self.settings.tries),
            url.to_string(),
        ]
    }
}

impl Default for WgetTransfer {
    fn default() -> Self {
        Self::new(TransferSettings::default())
    }
}

impl Transfer for WgetTransfer {
    fn fetch(
        &self,
        url: &str,
        destination: &Utf8Path,
        timeout: Duration,
    ) -> Result<(), TransferError> {
        let args = self.args(url, destination);
        debug!(program = %self.settings.program, ?args, "spawning transfer");
        let child = Command::new(&self.settings.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => TransferError::MissingTool(self.settings.program.clone()),
                _ => TransferError::Io(err.to_string()),
            })?;
        let (status, stderr) = wait_with_deadline(child, timeout)?;
        if status.success() {
            return Ok(());
        }
        let stderr = stderr.trim();
        Err(TransferError::Exit {
            program: self.settings.program.clone(),
            code: status.code().unwrap_or(-1),
            stderr: if stderr.is_empty() {
                "N/A".to_string()
            } else {
                stderr.to_string()
            },
        })
    }
}

// Stderr is drained on a side thread so a chatty child cannot block on a full pipe.
fn wait_with_deadline(
    mut child: Child,
    timeout: Duration,
) -> Result<(ExitStatus, String), TransferError> {
    let stderr_reader = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = String::new();
            let _ = pipe.read_to_string(&mut buffer);
            buffer
        })
    });

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() >= timeout {
                    reap(&mut child, stderr_reader);
                    return Err(TransferError::Timeout {
                        secs: timeout.as_secs(),
                    });
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(err) => {
                reap(&mut child, stderr_reader);
                return Err(TransferError::Io(err.to_string()));
            }
        }
    };

    let stderr = stderr_reader
        .and_then(|reader| reader.join().ok())
        .unwrap_or_default();
    Ok((status, stderr))
}

// Leaves no zombie child and no live stderr reader behind.
fn reap(child: &mut Child, stderr_reader: Option<JoinHandle<String>>) {
    let _ = child.kill();
    let _ = child.wait();
    if let Some(reader) = stderr_reader {
        let _ = reader.join();
    }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
