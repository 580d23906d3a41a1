use super::JobStatus;

/// Terminal status from the facts available at process exit.
///
/// A requested stop wins over everything else; after that the exit code and
/// the accumulated parsing flag decide. The network flag deliberately plays
/// no part here. Evaluated exactly once per job, when the process exits.
///
/// An absent exit code (process killed by a signal, or never spawned) counts
/// as a nonzero exit.
pub fn resolve_status(
    stop_requested: bool,
    exit_code: Option<i32>,
    has_parsing_errors: bool,
) -> JobStatus {
    if stop_requested {
        return JobStatus::Stopped;
    }
    match (exit_code, has_parsing_errors) {
        (Some(0), false) => JobStatus::Completed,
        (Some(0), true) => JobStatus::CompletedWithParsingErrors,
        (_, true) => JobStatus::FailedWithParsingErrors,
        (_, false) => JobStatus::Failed,
    }
}
