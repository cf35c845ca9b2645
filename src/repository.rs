//! Storage of test results.
//!
//! A repository provides append-only storage and indexing of test runs.
//! Two implementations share the [`Repository`] contract: [`memory`] for
//! tests and embedding, and [`file`] for the on-disk store the CLI uses.
//! Runs are never deleted; the "currently failing" view is derived from the
//! run history and regenerated after every insert.
//!
//! # Failing-view semantics
//!
//! The failing view holds at most one entry per `(test id, profile-filtered
//! tag set)` pair, where only members of the run's declared profiles are
//! retained for deduplication. A `fail` upserts the entry; `success`,
//! `skip` and `xfail` delete it. A non-partial run additionally sweeps away
//! entries for its declared profiles whose ids it did not mention at all.
//! Entries belonging to other profiles are untouched, which is what lets
//! independent per-profile runs coexist in one repository.

pub mod file;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_PROFILE;
use crate::subunit::{self, CodecError, TestEvent, TestStatus};

/// Identifier of a stored run. Strictly increasing in insertion order.
pub type RunId = u64;

/// Errors from repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("no repository found in {0}")]
    NotFound(PathBuf),

    #[error("repository already exists in {0}")]
    AlreadyExists(PathBuf),

    #[error("repository has no runs")]
    Empty,

    #[error("no run with id {0}")]
    NoSuchRun(RunId),

    #[error("an inserter is already open for this repository")]
    InserterBusy,

    #[error("corrupt repository metadata: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Timing data for a set of test ids.
///
/// `known` maps ids to their most recently recorded duration; `unknown`
/// holds the queried ids with no recorded timing.
#[derive(Debug, Clone, Default)]
pub struct TestTimes {
    pub known: HashMap<String, Duration>,
    pub unknown: HashSet<String>,
}

/// One materialised failing test.
///
/// `profiles` is the profile-filtered tag subset forming the dedup key;
/// `tags` is the full tag set from the most recent failure, kept for
/// display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailingEntry {
    pub id: String,
    pub profiles: BTreeSet<String>,
    pub tags: BTreeSet<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub details: BTreeMap<String, Vec<u8>>,
}

/// A test run retrieved from a repository.
///
/// The failing pseudo-run has no id; stored runs always do.
#[derive(Debug, Clone)]
pub struct StoredRun {
    id: Option<RunId>,
    events: Vec<TestEvent>,
}

impl StoredRun {
    pub fn new(id: Option<RunId>, events: Vec<TestEvent>) -> Self {
        StoredRun { id, events }
    }

    pub fn id(&self) -> Option<RunId> {
        self.id
    }

    pub fn events(&self) -> &[TestEvent] {
        &self.events
    }

    /// Encodes the run back into a subunit v2 stream.
    pub fn subunit_stream(&self) -> Result<Vec<u8>, CodecError> {
        subunit::encode_events(&self.events)
    }

    /// The ordered distinct ids that appeared with a non-enumeration
    /// status in this run.
    pub fn test_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for event in &self.events {
            let (Some(id), Some(status)) = (&event.id, event.status) else {
                continue;
            };
            if status == TestStatus::Exists {
                continue;
            }
            if seen.insert(id.clone()) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// The last terminal status observed per test id, in first-seen order.
    pub fn outcomes(&self) -> Vec<(String, TestStatus)> {
        let mut order = Vec::new();
        let mut last: HashMap<String, TestStatus> = HashMap::new();
        for event in &self.events {
            let (Some(id), Some(status)) = (&event.id, event.status) else {
                continue;
            };
            if !status.is_terminal() {
                continue;
            }
            if !last.contains_key(id) {
                order.push(id.clone());
            }
            last.insert(id.clone(), status);
        }
        order
            .into_iter()
            .map(|id| {
                let status = last[&id];
                (id, status)
            })
            .collect()
    }

    /// Whether any test's final status counts as a failure.
    pub fn has_failures(&self) -> bool {
        self.outcomes()
            .iter()
            .any(|(_, status)| status.is_failure())
    }

    /// Earliest event timestamp.
    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.events.iter().filter_map(|e| e.timestamp).min()
    }

    /// Latest event timestamp.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        self.events.iter().filter_map(|e| e.timestamp).max()
    }
}

/// A single-use writer for one run.
///
/// Obtained from [`Repository::get_inserter`]; the caller drives it with
/// [`start`](Inserter::start), any number of [`status`](Inserter::status)
/// calls and a final [`stop`](Inserter::stop), which commits the run and
/// yields its id. Dropping an unstopped inserter discards the run and
/// releases the repository for the next inserter.
pub trait Inserter: Send {
    /// Marks the beginning of the run.
    fn start(&mut self);

    /// Records one event.
    fn status(&mut self, event: TestEvent);

    /// Commits the run: persists events, refreshes the failing view and
    /// timing data, and returns the new run id.
    fn stop(self: Box<Self>) -> Result<RunId, RepositoryError>;
}

/// The storage contract shared by all repository backends.
pub trait Repository: Send + Sync {
    /// Number of runs stored.
    fn count(&self) -> Result<usize, RepositoryError>;

    /// Id of the most recently inserted run, or [`RepositoryError::Empty`].
    fn latest_id(&self) -> Result<RunId, RepositoryError>;

    /// Retrieves a run by id.
    fn get_test_run(&self, run_id: RunId) -> Result<StoredRun, RepositoryError>;

    /// Equivalent to `get_test_run(latest_id())`.
    fn get_latest_run(&self) -> Result<StoredRun, RepositoryError> {
        self.get_test_run(self.latest_id()?)
    }

    /// Ordered distinct non-enumeration ids of a run.
    fn get_test_ids(&self, run_id: RunId) -> Result<Vec<String>, RepositoryError> {
        Ok(self.get_test_run(run_id)?.test_ids())
    }

    /// Opens an inserter for a new run.
    ///
    /// `partial` marks runs that exercised only a subset of the project's
    /// tests; `profiles` declares the profiles the run may cover. Only one
    /// inserter may be open at a time per repository.
    fn get_inserter(
        &self,
        partial: bool,
        profiles: BTreeSet<String>,
    ) -> Result<Box<dyn Inserter + '_>, RepositoryError>;

    /// The current failing set, reconstructed as an id-less pseudo-run.
    fn get_failing(&self) -> Result<StoredRun, RepositoryError> {
        Ok(StoredRun::new(None, failing_events(&self.failing_entries()?)))
    }

    /// The raw failing entries, sorted by id then profile key.
    fn failing_entries(&self) -> Result<Vec<FailingEntry>, RepositoryError>;

    /// Estimated durations for `test_ids`.
    fn get_test_times(&self, test_ids: &[String]) -> Result<TestTimes, RepositoryError>;
}

/// The declared profile set with the empty case mapped to the sentinel.
fn effective_profiles(declared: &BTreeSet<String>) -> BTreeSet<String> {
    if declared.is_empty() {
        [DEFAULT_PROFILE.to_string()].into()
    } else {
        declared.clone()
    }
}

type FailingKey = (String, BTreeSet<String>);

fn entry_key(entry: &FailingEntry) -> FailingKey {
    (entry.id.clone(), entry.profiles.clone())
}

/// Folds one run's events into the failing view and timing table.
///
/// This is the shared maintenance pass both backends invoke from
/// `Inserter::stop`. `failing` is replaced with the updated entry list,
/// sorted by key; `times` is updated in place, latest run winning.
pub(crate) fn integrate_run(
    failing: &mut Vec<FailingEntry>,
    times: &mut HashMap<String, Duration>,
    events: &[TestEvent],
    partial: bool,
    declared: &BTreeSet<String>,
) {
    let profiles = effective_profiles(declared);
    let mut entries: BTreeMap<FailingKey, FailingEntry> = failing
        .drain(..)
        .map(|entry| (entry_key(&entry), entry))
        .collect();

    let mut seen_ids: HashSet<String> = HashSet::new();
    let mut started: HashMap<String, DateTime<Utc>> = HashMap::new();
    let mut details: HashMap<String, BTreeMap<String, Vec<u8>>> = HashMap::new();

    for event in events {
        let Some(id) = &event.id else { continue };
        if let (Some(name), Some(bytes)) = (&event.file_name, &event.file_bytes) {
            details
                .entry(id.clone())
                .or_default()
                .insert(name.clone(), bytes.clone());
        }
        let Some(status) = event.status else { continue };
        match status {
            TestStatus::Exists => {}
            TestStatus::InProgress => {
                if let Some(at) = event.timestamp {
                    started.insert(id.clone(), at);
                }
                details.remove(id);
                seen_ids.insert(id.clone());
            }
            terminal => {
                seen_ids.insert(id.clone());
                let profile_tags: BTreeSet<String> =
                    event.tags.intersection(&profiles).cloned().collect();
                let key = (id.clone(), profile_tags.clone());
                match terminal {
                    TestStatus::Fail => {
                        entries.insert(
                            key,
                            FailingEntry {
                                id: id.clone(),
                                profiles: profile_tags,
                                tags: event.tags.clone(),
                                start: started.get(id).copied().or(event.timestamp),
                                end: event.timestamp,
                                details: details.remove(id).unwrap_or_default(),
                            },
                        );
                    }
                    TestStatus::Success | TestStatus::Skip | TestStatus::XFail => {
                        entries.remove(&key);
                    }
                    // Unexpected successes count as failures for exit codes
                    // but do not edit the failing view.
                    _ => {}
                }
                // Timing: explicit inprogress -> success/fail pairs only.
                if matches!(terminal, TestStatus::Success | TestStatus::Fail) {
                    if let (Some(begin), Some(end)) = (started.get(id), event.timestamp) {
                        if let Ok(duration) = (end - *begin).to_std() {
                            times.insert(id.clone(), duration);
                        }
                    }
                }
            }
        }
    }

    if !partial {
        // A full run is authoritative for its profiles: entries it did not
        // mention at all are gone tests.
        entries.retain(|(id, entry_profiles), _| {
            !(entry_profiles.is_subset(&profiles) && !seen_ids.contains(id))
        });
    }

    failing.extend(entries.into_values());
}

/// Reconstructs a failing entry list as an event stream.
pub(crate) fn failing_events(entries: &[FailingEntry]) -> Vec<TestEvent> {
    let mut events = Vec::new();
    for entry in entries {
        let mut begin = TestEvent::new(&entry.id, TestStatus::InProgress);
        if let Some(at) = entry.start {
            begin = begin.with_timestamp(at);
        }
        events.push(begin);
        for (name, bytes) in &entry.details {
            events.push(
                TestEvent::new(&entry.id, TestStatus::Fail).with_file(name, bytes.clone()),
            );
        }
        let mut fail = TestEvent::new(&entry.id, TestStatus::Fail)
            .with_tags(entry.tags.iter().cloned());
        if let Some(at) = entry.end {
            fail = fail.with_timestamp(at);
        }
        events.push(fail);
    }
    events
}

/// Selects the known/unknown split for a timing query.
pub(crate) fn select_times(times: &HashMap<String, Duration>, test_ids: &[String]) -> TestTimes {
    let mut result = TestTimes::default();
    for id in test_ids {
        match times.get(id) {
            Some(duration) => {
                result.known.insert(id.clone(), *duration);
            }
            None => {
                result.unknown.insert(id.clone());
            }
        }
    }
    result
}
