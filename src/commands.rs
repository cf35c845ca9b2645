//! Command implementations behind the CLI.
//!
//! Each function here is one user-visible operation, written against the
//! library seams (`Repository`, `Ui`) so the test suite can drive them
//! without a terminal. The returned integers are process exit codes:
//! 0 success, 1 failures present.

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;

use crate::errors::QuarryError;
use crate::repository::Repository;
use crate::subunit;
use crate::ui::{ListStyle, RunSummary, TestMeta, Ui};

/// Output mode for the `failing` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailingMode {
    /// Render through the results sink and summary.
    #[default]
    Default,
    /// Print only the failing test ids (optionally as JSON).
    List(ListStyle),
    /// Pass the raw subunit stream through.
    Stream,
}

/// Shows the current failures known by the repository.
///
/// Exit code 1 when there are failures, except in stream mode where the
/// code only reflects whether the stream could be produced.
pub fn failing(
    repository: &dyn Repository,
    ui: &dyn Ui,
    profiles: &BTreeSet<String>,
    mode: FailingMode,
) -> Result<i32, QuarryError> {
    let run = repository.get_failing()?;
    if mode == FailingMode::Stream {
        let stream = run.subunit_stream()?;
        ui.output_stream(&stream)?;
        return Ok(0);
    }

    let failed = run.has_failures();
    match mode {
        FailingMode::List(style) => {
            let mut tests: BTreeMap<String, TestMeta> = BTreeMap::new();
            for entry in repository.failing_entries()? {
                let meta = tests.entry(entry.id.clone()).or_default();
                for profile in entry.tags.intersection(profiles) {
                    meta.add_profile(profile);
                }
            }
            ui.output_tests_meta(&tests, style)?;
        }
        _ => {
            for event in run.events() {
                ui.on_test_event(event);
            }
            ui.on_run_complete(&RunSummary::from_events(run.events(), &BTreeSet::new()));
        }
    }
    Ok(if failed { 1 } else { 0 })
}

/// Summarises the most recent run.
pub fn last(repository: &dyn Repository, ui: &dyn Ui) -> Result<i32, QuarryError> {
    let run = repository.get_latest_run()?;
    let id = run.id().expect("stored runs carry an id");
    ui.output_values(&[("run id", id.to_string())]);
    let mut failed = false;
    for (test_id, status) in run.outcomes() {
        if status.is_failure() {
            failed = true;
            ui.output_values(&[("failing", test_id)]);
        }
    }
    ui.on_run_complete(&RunSummary::from_events(run.events(), &BTreeSet::new()));
    Ok(if failed { 1 } else { 0 })
}

/// Loads a subunit v2 stream into the repository as one run.
///
/// Events without timestamps are stamped at ingestion so the run carries
/// timing data. Exit code 1 when the stream contained failures.
pub fn load(
    repository: &dyn Repository,
    ui: &dyn Ui,
    stream: &[u8],
    partial: bool,
    profiles: BTreeSet<String>,
) -> Result<i32, QuarryError> {
    let mut inserter = repository.get_inserter(partial, profiles)?;
    inserter.start();
    let mut events = Vec::new();
    for mut event in subunit::decode_all(stream) {
        if event.timestamp.is_none() {
            event.timestamp = Some(Utc::now());
        }
        ui.on_test_event(&event);
        inserter.status(event.clone());
        events.push(event);
    }
    let run_id = inserter.stop()?;
    let summary = RunSummary::from_events(&events, &BTreeSet::new());
    ui.output_values(&[("run id", run_id.to_string())]);
    ui.on_run_complete(&summary);
    Ok(if summary.successful() { 0 } else { 1 })
}

/// Renders an enumerated test listing.
pub fn list_tests(
    ui: &dyn Ui,
    tests: &BTreeMap<String, TestMeta>,
    style: ListStyle,
) -> Result<i32, QuarryError> {
    ui.output_tests_meta(tests, style)?;
    Ok(0)
}
