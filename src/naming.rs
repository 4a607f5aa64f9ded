use std::sync::LazyLock;

use camino::Utf8Path;
use regex::Regex;

pub const DEFAULT_PARTITION: &str = "unknown_query_parameters";
pub const RETRY_PARTITION: &str = "retry_downloads";

const KEYWORD_MAX_LEN: usize = 35;
const CATEGORY_MAX_LEN: usize = 25;
const SEED_MAX_LEN: usize = 60;

static UNSAFE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_.-]+").expect("valid dirname pattern"));
static UNDERSCORE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_+").expect("valid underscore pattern"));
static TIMESTAMP_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_\d{8}_\d{6}$").expect("valid timestamp pattern"));

/// On-disk filename stem for an identity. Old-style arXiv ids such as
/// `math/0211159v1` contain a slash, which would otherwise become a directory.
pub fn safe_identity(identity: &str) -> String {
    identity.replace(['/', '\\'], "_")
}

pub fn artifact_file_name(identity: &str) -> String {
    format!("{}.pdf", safe_identity(identity))
}

pub fn sanitize_for_dirname(text: &str, max_len: usize) -> String {
    let replaced = UNSAFE_RUN.replace_all(text, "_");
    let collapsed = UNDERSCORE_RUN.replace_all(&replaced, "_");
    let mut sanitized: &str = &collapsed;
    if let Some(rest) = sanitized.strip_prefix('_') {
        sanitized = rest;
    }
    if let Some(rest) = sanitized.strip_suffix('_') {
        sanitized = rest;
    }
    // Only ASCII survives the replacement, so byte slicing is char-safe.
    if max_len > 0 && sanitized.len() > max_len {
        sanitized = &sanitized[..max_len];
    }
    sanitized.to_string()
}

pub fn facet_partition(keyword: Option<&str>, category: Option<&str>) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(keyword) = keyword {
        let keyword = sanitize_for_dirname(keyword, KEYWORD_MAX_LEN);
        if !keyword.is_empty() {
            parts.push(format!("kw_{keyword}"));
        }
    }
    if let Some(category) = category {
        let category = sanitize_for_dirname(category, CATEGORY_MAX_LEN);
        if !category.is_empty() {
            parts.push(format!("cat_{category}"));
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("_"))
    }
}

pub fn partition_name(
    keyword: Option<&str>,
    category: Option<&str>,
    fallback_seed: Option<&str>,
) -> String {
    if let Some(name) = facet_partition(keyword, category) {
        return name;
    }
    fallback_seed
        .map(seed_partition)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| DEFAULT_PARTITION.to_string())
}

fn seed_partition(seed: &str) -> String {
    let stem = Utf8Path::new(seed).file_stem().unwrap_or(seed);
    let stem = TIMESTAMP_SUFFIX.replace(stem, "");
    sanitize_for_dirname(&stem, SEED_MAX_LEN)
}
