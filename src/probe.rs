use std::io::Read;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::{debug, info, warn};

use crate::error::HarvestError;

pub const DEFAULT_MIRROR_BASE: &str = "https://export.arxiv.org/pdf";

pub trait Prober: Send + Sync {
    fn measure(&self, url: &str) -> Option<Duration>;
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub read_bytes: u64,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            read_bytes: 10 * 1024,
        }
    }
}

#[derive(Clone)]
pub struct HttpProber {
    client: Client,
    read_bytes: u64,
}

impl HttpProber {
    pub fn new(settings: ProbeSettings) -> Result<Self, HarvestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("paper-harvest/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| HarvestError::ProbeHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(settings.timeout)
            .timeout(settings.timeout)
            .build()
            .map_err(|err| HarvestError::ProbeHttp(err.to_string()))?;
        Ok(Self {
            client,
            read_bytes: settings.read_bytes,
        })
    }
}

impl Prober for HttpProber {
    fn measure(&self, url: &str) -> Option<Duration> {
        let start = Instant::now();
        let response = match self.client.get(url).send() {
            Ok(response) => response,
            Err(err) => {
                warn!(url, error = %err, "probe request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(url, status = response.status().as_u16(), "probe returned error status");
            return None;
        }
        let mut window = Vec::new();
        if let Err(err) = response.take(self.read_bytes).read_to_end(&mut window) {
            warn!(url, error = %err, "probe read failed");
            return None;
        }
        let elapsed = start.elapsed();
        debug!(url, bytes = window.len(), elapsed_ms = elapsed.as_millis() as u64, "probe complete");
        Some(elapsed)
    }
}

pub fn mirror_url(mirror_base: &str, identity: &str) -> String {
    format!("{}/{}", mirror_base.trim_end_matches('/'), identity)
}

pub fn choose_best_url(
    prober: &dyn Prober,
    identity: &str,
    primary: Option<&str>,
    mirror_base: &str,
) -> Option<String> {
    let mirror = mirror_url(mirror_base, identity);
    let mut candidates: Vec<(&str, String)> = Vec::new();
    if let Some(primary) = primary.filter(|url| !url.trim().is_empty()) {
        candidates.push(("primary", primary.to_string()));
    }
    if primary != Some(mirror.as_str()) && !identity.trim().is_empty() {
        candidates.push(("export_mirror", mirror.clone()));
    }

    match candidates.len() {
        0 => {
            warn!(entry_id = identity, "no candidate URL to probe");
            return None;
        }
        1 => {
            let (name, url) = candidates.remove(0);
            debug!(entry_id = identity, source = name, url = %url, "single candidate, skipping probe");
            return Some(url);
        }
        _ => {}
    }

    info!(entry_id = identity, "probing download sources");
    let mut best: Option<(&str, &str, Duration)> = None;
    for (name, url) in &candidates {
        let measured = prober.measure(url);
        match measured {
            Some(elapsed) => {
                info!(entry_id = identity, source = *name, url = %url, elapsed_ms = elapsed.as_millis() as u64, "probe result");
                if best.map(|(_, _, current)| elapsed < current).unwrap_or(true) {
                    best = Some((*name, url.as_str(), elapsed));
                }
            }
            None => info!(entry_id = identity, source = *name, url = %url, "probe result: unreachable"),
        }
    }

    match best {
        Some((name, url, elapsed)) => {
            info!(entry_id = identity, source = name, url, elapsed_ms = elapsed.as_millis() as u64, "selected download source");
            Some(url.to_string())
        }
        None => {
            warn!(entry_id = identity, "all probes failed, falling back");
            Some(
                primary
                    .filter(|url| !url.trim().is_empty())
                    .map(str::to_string)
                    .unwrap_or(mirror),
            )
        }
    }
}
