//! On-disk repository backend.
//!
//! The repository is a `.quarry` directory inside the project root:
//!
//! ```text
//! .quarry/
//!   format         version marker ("1")
//!   next-stream    id the next run will receive
//!   0, 1, 2, ...   one encoded subunit v2 stream per run
//!   failing        derived failing view, regenerated on every insert
//!   failing.json   failing entries with their dedup keys
//!   times.json     per-test durations, latest run wins
//! ```
//!
//! Run files are written whole via a temp file and rename, so a crashed
//! insert never leaves a half-written stream behind; `next-stream` is
//! bumped last, making the new run visible only once it is durable.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::debug;

use super::{
    failing_events, integrate_run, select_times, FailingEntry, Inserter, Repository,
    RepositoryError, RunId, StoredRun, TestTimes,
};
use crate::subunit::{self, TestEvent};

/// Name of the repository directory created inside a project root.
pub const REPO_DIR: &str = ".quarry";

const FORMAT_MARKER: &str = "1\n";

/// Repository stored in a `.quarry` directory.
pub struct FileRepository {
    root: PathBuf,
    inserter_open: AtomicBool,
}

impl FileRepository {
    /// Creates a new repository under `base`.
    ///
    /// Fails with [`RepositoryError::AlreadyExists`] if `base` already
    /// holds one.
    pub fn initialise(base: &Path) -> Result<Self, RepositoryError> {
        let root = base.join(REPO_DIR);
        if root.exists() {
            return Err(RepositoryError::AlreadyExists(base.to_path_buf()));
        }
        fs::create_dir_all(&root)?;
        fs::write(root.join("format"), FORMAT_MARKER)?;
        fs::write(root.join("next-stream"), "0\n")?;
        fs::write(root.join("times.json"), "{}\n")?;
        fs::write(root.join("failing.json"), "[]\n")?;
        fs::write(root.join("failing"), b"")?;
        debug!("initialised repository at {}", root.display());
        Ok(FileRepository {
            root,
            inserter_open: AtomicBool::new(false),
        })
    }

    /// Opens the repository under `base`, failing with
    /// [`RepositoryError::NotFound`] if there is none.
    pub fn open(base: &Path) -> Result<Self, RepositoryError> {
        let root = base.join(REPO_DIR);
        if !root.join("format").is_file() {
            return Err(RepositoryError::NotFound(base.to_path_buf()));
        }
        Ok(FileRepository {
            root,
            inserter_open: AtomicBool::new(false),
        })
    }

    /// The repository directory itself (home of `failing.list`).
    pub fn path(&self) -> &Path {
        &self.root
    }

    fn next_stream(&self) -> Result<u64, RepositoryError> {
        let raw = fs::read_to_string(self.root.join("next-stream"))?;
        raw.trim()
            .parse()
            .map_err(|_| RepositoryError::Corrupt(format!("bad next-stream: {raw:?}")))
    }

    fn load_times(&self) -> Result<HashMap<String, Duration>, RepositoryError> {
        let raw = fs::read_to_string(self.root.join("times.json"))?;
        serde_json::from_str(&raw)
            .map_err(|e| RepositoryError::Corrupt(format!("bad times.json: {e}")))
    }

    fn load_failing(&self) -> Result<Vec<FailingEntry>, RepositoryError> {
        let raw = fs::read_to_string(self.root.join("failing.json"))?;
        serde_json::from_str(&raw)
            .map_err(|e| RepositoryError::Corrupt(format!("bad failing.json: {e}")))
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), RepositoryError> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(bytes)?;
        tmp.persist(self.root.join(name))
            .map_err(|e| RepositoryError::Io(e.error))?;
        Ok(())
    }
}

impl Repository for FileRepository {
    fn count(&self) -> Result<usize, RepositoryError> {
        Ok(self.next_stream()? as usize)
    }

    fn latest_id(&self) -> Result<RunId, RepositoryError> {
        match self.next_stream()? {
            0 => Err(RepositoryError::Empty),
            n => Ok(n - 1),
        }
    }

    fn get_test_run(&self, run_id: RunId) -> Result<StoredRun, RepositoryError> {
        let path = self.root.join(run_id.to_string());
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RepositoryError::NoSuchRun(run_id));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(StoredRun::new(Some(run_id), subunit::decode_all(&bytes)))
    }

    fn get_inserter(
        &self,
        partial: bool,
        profiles: BTreeSet<String>,
    ) -> Result<Box<dyn Inserter + '_>, RepositoryError> {
        if self.inserter_open.swap(true, Ordering::SeqCst) {
            return Err(RepositoryError::InserterBusy);
        }
        Ok(Box::new(FileInserter {
            repository: self,
            partial,
            profiles,
            events: Vec::new(),
        }))
    }

    fn failing_entries(&self) -> Result<Vec<FailingEntry>, RepositoryError> {
        self.load_failing()
    }

    fn get_test_times(&self, test_ids: &[String]) -> Result<TestTimes, RepositoryError> {
        Ok(select_times(&self.load_times()?, test_ids))
    }
}

struct FileInserter<'a> {
    repository: &'a FileRepository,
    partial: bool,
    profiles: BTreeSet<String>,
    events: Vec<TestEvent>,
}

impl Inserter for FileInserter<'_> {
    fn start(&mut self) {}

    fn status(&mut self, event: TestEvent) {
        self.events.push(event);
    }

    fn stop(self: Box<Self>) -> Result<RunId, RepositoryError> {
        let repo = self.repository;
        let run_id = repo.next_stream()?;

        let stream = subunit::encode_events(&self.events)?;
        repo.write_atomic(&run_id.to_string(), &stream)?;

        let mut failing = repo.load_failing()?;
        let mut times = repo.load_times()?;
        integrate_run(
            &mut failing,
            &mut times,
            &self.events,
            self.partial,
            &self.profiles,
        );
        repo.write_atomic(
            "failing.json",
            serde_json::to_string_pretty(&failing)
                .map_err(|e| RepositoryError::Corrupt(e.to_string()))?
                .as_bytes(),
        )?;
        let failing_stream = subunit::encode_events(&failing_events(&failing))?;
        repo.write_atomic("failing", &failing_stream)?;
        repo.write_atomic(
            "times.json",
            serde_json::to_string(&times)
                .map_err(|e| RepositoryError::Corrupt(e.to_string()))?
                .as_bytes(),
        )?;

        // Publish the run last.
        repo.write_atomic("next-stream", format!("{}\n", run_id + 1).as_bytes())?;
        debug!(run_id, events = self.events.len(), "committed run");
        Ok(run_id)
    }
}

impl Drop for FileInserter<'_> {
    fn drop(&mut self) {
        self.repository.inserter_open.store(false, Ordering::SeqCst);
    }
}
