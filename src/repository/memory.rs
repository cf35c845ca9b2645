//! In-memory repository backend.
//!
//! Keeps runs, the failing view and timing data in process memory. Used by
//! the test suite and by embedders that want orchestration without a
//! persistent store.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    integrate_run, select_times, FailingEntry, Inserter, Repository, RepositoryError, RunId,
    StoredRun, TestTimes,
};
use crate::subunit::TestEvent;

#[derive(Default)]
struct State {
    runs: Vec<Vec<TestEvent>>,
    failing: Vec<FailingEntry>,
    times: HashMap<String, Duration>,
}

/// A repository living entirely in memory.
#[derive(Default)]
pub struct MemoryRepository {
    state: Mutex<State>,
    inserter_open: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Repository for MemoryRepository {
    fn count(&self) -> Result<usize, RepositoryError> {
        Ok(self.state.lock().expect("state lock").runs.len())
    }

    fn latest_id(&self) -> Result<RunId, RepositoryError> {
        let state = self.state.lock().expect("state lock");
        match state.runs.len() {
            0 => Err(RepositoryError::Empty),
            n => Ok(n as RunId - 1),
        }
    }

    fn get_test_run(&self, run_id: RunId) -> Result<StoredRun, RepositoryError> {
        let state = self.state.lock().expect("state lock");
        state
            .runs
            .get(run_id as usize)
            .map(|events| StoredRun::new(Some(run_id), events.clone()))
            .ok_or(RepositoryError::NoSuchRun(run_id))
    }

    fn get_inserter(
        &self,
        partial: bool,
        profiles: BTreeSet<String>,
    ) -> Result<Box<dyn Inserter + '_>, RepositoryError> {
        if self.inserter_open.swap(true, Ordering::SeqCst) {
            return Err(RepositoryError::InserterBusy);
        }
        Ok(Box::new(MemoryInserter {
            repository: self,
            partial,
            profiles,
            events: Vec::new(),
        }))
    }

    fn failing_entries(&self) -> Result<Vec<FailingEntry>, RepositoryError> {
        Ok(self.state.lock().expect("state lock").failing.clone())
    }

    fn get_test_times(&self, test_ids: &[String]) -> Result<TestTimes, RepositoryError> {
        let state = self.state.lock().expect("state lock");
        Ok(select_times(&state.times, test_ids))
    }
}

struct MemoryInserter<'a> {
    repository: &'a MemoryRepository,
    partial: bool,
    profiles: BTreeSet<String>,
    events: Vec<TestEvent>,
}

impl Inserter for MemoryInserter<'_> {
    fn start(&mut self) {}

    fn status(&mut self, event: TestEvent) {
        self.events.push(event);
    }

    fn stop(self: Box<Self>) -> Result<RunId, RepositoryError> {
        let mut state = self.repository.state.lock().expect("state lock");
        let state = &mut *state;
        integrate_run(
            &mut state.failing,
            &mut state.times,
            &self.events,
            self.partial,
            &self.profiles,
        );
        state.runs.push(self.events.clone());
        Ok(state.runs.len() as RunId - 1)
    }
}

impl Drop for MemoryInserter<'_> {
    fn drop(&mut self) {
        self.repository.inserter_open.store(false, Ordering::SeqCst);
    }
}
