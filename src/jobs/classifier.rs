//! Heuristic classification of worker log lines.
//!
//! The worker is an external, non-instrumentable process; its combined output
//! stream is the only signal surface besides the exit code, so completion
//! quality has to be inferred from known log phrases. The matchers live in
//! data tables rather than inline conditionals: adding a new signal means
//! adding a row here, and the status resolver never changes.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};

/// Per-line classification. OR-accumulated into the owning job's flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineSignals {
    pub parsing: bool,
    pub network: bool,
    pub success: bool,
}

/// Lines the worker emits when extraction went wrong but the process itself
/// may still exit cleanly.
const PARSING_ERROR_PATTERNS: &[&str] = &[
    r"finished with parsing errors",
    r"has_parsing_errors:\s*true",
    r"error extracting (field|item|photos|phones|detail)",
    r"invalid json in response",
    r"required selectors not found",
    r"no ads container found",
    r"error processing item",
];

/// Transport-layer trouble. Diagnostic only: the network flag never enters
/// the terminal status table.
const NETWORK_ERROR_PATTERNS: &[&str] = &[
    r"dns lookup failed",
    r"connection refused",
    r"connection timeout",
    r"network unreachable",
    r"host unreachable",
    r"request failed",
    r"gave up retrying",
    r"downloader/exception_(count|type_count)",
];

const SUCCESS_PATTERNS: &[&str] = &[
    r"closed.*success",
    r"items scraped:\s*\d+",
    r"successfully extracted",
];

static PARSING_SET: Lazy<RegexSet> = Lazy::new(|| build_set(PARSING_ERROR_PATTERNS));
static NETWORK_SET: Lazy<RegexSet> = Lazy::new(|| build_set(NETWORK_ERROR_PATTERNS));
static SUCCESS_SET: Lazy<RegexSet> = Lazy::new(|| build_set(SUCCESS_PATTERNS));

fn build_set(patterns: &[&str]) -> RegexSet {
    let case_insensitive: Vec<String> = patterns.iter().map(|p| format!("(?i){p}")).collect();
    RegexSet::new(case_insensitive).expect("invalid log pattern table")
}

/// Pure and stateless; cheap enough to run on every emitted line.
pub fn classify(line: &str) -> LineSignals {
    LineSignals {
        parsing: PARSING_SET.is_match(line),
        network: NETWORK_SET.is_match(line),
        success: SUCCESS_SET.is_match(line),
    }
}

static NEW_ADS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)new ads:\s*(\d+)").expect("invalid counter pattern"));
static ITEMS_SCRAPED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)items scraped:\s*(\d+)").expect("invalid counter pattern"));

/// Counters the worker prints in its run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineCounters {
    pub new_ads: Option<i64>,
    pub items_scraped: Option<i64>,
}

pub fn extract_counters(line: &str) -> LineCounters {
    let capture = |re: &Regex| {
        re.captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    };
    LineCounters {
        new_ads: capture(&NEW_ADS_RE),
        items_scraped: capture(&ITEMS_SCRAPED_RE),
    }
}
