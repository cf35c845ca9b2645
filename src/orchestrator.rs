//! Run orchestration.
//!
//! The [`RunController`] drives one test run end to end:
//!
//! ```text
//!   config ──▶ resolve concurrency, profiles
//!                   │
//!         enumerate tests? ($LISTOPT workers, exists events)
//!                   │
//!            apply filters
//!                   │
//!        partition per profile (scheduler, repository timings)
//!                   │
//!      ┌── worker 0 ─ worker 1 ─ ... ─ worker K ──┐   (instances)
//!      │        subunit streams on stdout         │
//!      └───────────────── fan-in ─────────────────┘
//!                   │
//!        repository inserter + UI results sink
//! ```
//!
//! Workers run in parallel as external processes; the controller itself is
//! a single cooperative task, so the pool, the inserter and the UI are only
//! ever touched from one place. On interrupt the controller kills its
//! workers, drains what they produced, commits the partial run and still
//! disposes every provisioned instance.

pub mod provision;
mod worker;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ConfigError, TestConfig, DEFAULT_PROFILE};
use crate::connector::Connector;
use crate::errors::QuarryError;
use crate::instance::Instance;
use crate::repository::{Inserter, Repository};
use crate::scheduler::{partition_tests, GroupOf, RegexGroup};
use crate::subst::expand;
use crate::subunit::{self, TestEvent};
use crate::testlist::parse_enumeration;
use crate::ui::{RunSummary, TestMeta, Ui};

pub use provision::InstanceSource;
pub use worker::RETURNCODE_TEST_ID;

/// Name of the fixed list file used by failing-only runs.
pub const FAILING_LIST: &str = "failing.list";

/// Options for one invocation of [`RunController::run`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit tests to run, keyed by id with their profiles. `None`
    /// resolves ids from enumeration or leaves the choice to the backend.
    pub test_ids: Option<BTreeMap<String, TestMeta>>,

    /// Extra arguments appended to the test command.
    pub extra_args: Vec<String>,

    /// Regex filters; a test runs when any filter matches its id
    /// (unanchored search).
    pub filters: Option<Vec<String>>,

    /// Worker count override. Otherwise the `test_run_concurrency`
    /// callout, then the host CPU count, then 1.
    pub concurrency: Option<usize>,

    /// Run only the currently failing tests.
    pub failing_only: bool,

    /// Repeat the run until one fails.
    pub until_failure: bool,
}

struct WorkerHandle {
    profile: String,
    instance: Option<Instance>,
    task: JoinHandle<i32>,
}

/// Orchestrates test runs against one repository and configuration.
pub struct RunController<'a> {
    config: TestConfig,
    repository: &'a dyn Repository,
    ui: &'a dyn Ui,
    connector: &'a dyn Connector,
    list_dir: PathBuf,
    cancel: CancellationToken,
}

impl<'a> RunController<'a> {
    /// Creates a controller.
    ///
    /// `list_dir` is where the fixed `failing.list` file lives, normally
    /// the repository directory.
    pub fn new(
        config: TestConfig,
        repository: &'a dyn Repository,
        ui: &'a dyn Ui,
        connector: &'a dyn Connector,
        list_dir: PathBuf,
    ) -> Self {
        RunController {
            config,
            repository,
            ui,
            connector,
            list_dir,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that interrupts the run when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs a shell callout configured under `key`, returning its stdout.
    async fn callout(&self, key: &'static str) -> Result<Option<String>, QuarryError> {
        let Some(cmd) = self.config.get(key) else {
            return Ok(None);
        };
        let output = self.connector.run(cmd).await?;
        if !output.success() {
            return Err(QuarryError::CalloutFailed {
                key,
                code: output.exit_code,
                stderr: output.stderr_text(),
            });
        }
        Ok(Some(output.stdout_text()))
    }

    async fn resolve_concurrency(&self, options: &RunOptions) -> Result<usize, QuarryError> {
        if let Some(concurrency) = options.concurrency {
            return Ok(concurrency.max(1));
        }
        if let Some(out) = self.callout("test_run_concurrency").await? {
            let trimmed = out.trim().to_string();
            return trimmed
                .parse::<usize>()
                .map(|c| c.max(1))
                .map_err(|_| QuarryError::BadConfigValue {
                    key: "test_run_concurrency",
                    reason: format!("stdout {trimmed:?} is not a number"),
                });
        }
        Ok(std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1))
    }

    /// Resolves `(profiles, default_profiles)` from the config callouts.
    pub async fn resolve_profiles(
        &self,
    ) -> Result<(BTreeSet<String>, BTreeSet<String>), QuarryError> {
        let profiles: BTreeSet<String> = match self.callout("list_profiles").await? {
            Some(out) => out.split_whitespace().map(str::to_string).collect(),
            None => BTreeSet::new(),
        };
        let profiles = if profiles.is_empty() {
            [DEFAULT_PROFILE.to_string()].into()
        } else {
            profiles
        };
        let default_profiles: BTreeSet<String> = match self.callout("default_profiles").await? {
            Some(out) => out.split_whitespace().map(str::to_string).collect(),
            None => BTreeSet::new(),
        };
        let default_profiles = if default_profiles.is_empty() {
            profiles.clone()
        } else {
            default_profiles
        };
        Ok((profiles, default_profiles))
    }

    /// Enumerates tests across `profiles` by running the command template
    /// with `$LISTOPT` substituted and decoding the `exists` events.
    async fn enumerate_tests(
        &self,
        template: &str,
        profiles: &BTreeSet<String>,
        source: &mut InstanceSource<'_>,
    ) -> Result<BTreeMap<String, TestMeta>, QuarryError> {
        if !template.contains("$LISTOPT") {
            return Err(QuarryError::BadConfigValue {
                key: "test_command",
                reason: "no $LISTOPT variable; tests cannot be enumerated".into(),
            });
        }
        let listopt = self
            .config
            .test_list_option()
            .ok_or(ConfigError::MissingKey("test_list_option"))?;
        let default_idlist = self.config.test_id_list_default().unwrap_or("");

        let mut tests: BTreeMap<String, TestMeta> = BTreeMap::new();
        for profile in profiles {
            let instance = source.obtain_instance(profile).await?;
            let cmd = expand(
                template,
                &[
                    ("LISTOPT", listopt),
                    ("IDLIST", default_idlist),
                    ("IDFILE", ""),
                    ("IDOPTION", ""),
                    ("PROFILE", profile),
                ],
            );
            let cmd = worker::instance_wrap(
                cmd,
                instance.as_ref(),
                self.config.instance_execute(),
                profile,
                None,
            );
            self.ui.output_values(&[("running", cmd.clone())]);
            let output = self.connector.run(&cmd).await;
            if let Some(instance) = &instance {
                source.release_instance(instance)?;
            }
            let output = output?;
            if !output.success() {
                // Forward whatever the backend said before failing.
                let events = subunit::decode_all(&output.stdout);
                self.ui.output_stream(&subunit::cat_files(&events))?;
                self.ui.output_stream(&output.stderr)?;
                return Err(QuarryError::ListFailed {
                    code: output.exit_code,
                });
            }
            let ids = parse_enumeration(&output.stdout);
            debug!(profile = %profile, count = ids.len(), "enumerated tests");
            for id in ids {
                tests.entry(id).or_default().add_profile(profile);
            }
        }
        Ok(tests)
    }

    fn filter_tests(
        tests: BTreeMap<String, TestMeta>,
        filters: &[String],
    ) -> Result<BTreeMap<String, TestMeta>, QuarryError> {
        let mut regexes = Vec::with_capacity(filters.len());
        for filter in filters {
            regexes.push(
                regex::Regex::new(filter).map_err(|e| QuarryError::BadConfigValue {
                    key: "filters",
                    reason: e.to_string(),
                })?,
            );
        }
        Ok(tests
            .into_iter()
            .filter(|(id, _)| regexes.iter().any(|regex| regex.is_match(id)))
            .collect())
    }

    /// Enumerates the project's tests without running them.
    ///
    /// Provisioned instances used for the listing are disposed before
    /// returning.
    pub async fn list_tests(
        &self,
        filters: Option<&[String]>,
    ) -> Result<BTreeMap<String, TestMeta>, QuarryError> {
        let template = self.config.test_command()?.to_string();
        let (_, default_profiles) = self.resolve_profiles().await?;
        let mut source = InstanceSource::new(self.connector, self.ui, &self.config, 1);
        let listed = self
            .enumerate_tests(&template, &default_profiles, &mut source)
            .await;
        let dispose = source.dispose_all().await;
        let tests = listed?;
        dispose?;
        match filters {
            Some(filters) => Self::filter_tests(tests, filters),
            None => Ok(tests),
        }
    }

    /// Runs tests and returns the process exit code: 0 when everything
    /// passed, 1 otherwise.
    pub async fn run(&self, options: &RunOptions) -> Result<i32, QuarryError> {
        let concurrency = self.resolve_concurrency(options).await?;
        let (_, default_profiles) = self.resolve_profiles().await?;
        info!(concurrency, "starting test run");

        let mut source =
            InstanceSource::new(self.connector, self.ui, &self.config, concurrency);
        let mut result = self
            .run_once(options, concurrency, &default_profiles, &mut source)
            .await;
        if options.until_failure {
            while let Ok(0) = result {
                if self.cancel.is_cancelled() {
                    break;
                }
                result = self
                    .run_once(options, concurrency, &default_profiles, &mut source)
                    .await;
            }
        }
        let dispose = source.dispose_all().await;
        let code = result?;
        dispose?;
        Ok(code)
    }

    async fn run_once(
        &self,
        options: &RunOptions,
        concurrency: usize,
        default_profiles: &BTreeSet<String>,
        source: &mut InstanceSource<'_>,
    ) -> Result<i32, QuarryError> {
        let mut template = self.config.test_command()?.to_string();
        if !options.extra_args.is_empty() {
            template = format!(
                "{} {}",
                template,
                shell_words::join(options.extra_args.iter())
            );
        }
        let idoption_template = if template.contains("$IDOPTION") {
            Some(
                self.config
                    .test_id_option()
                    .ok_or(ConfigError::MissingKey("test_id_option"))?
                    .to_string(),
            )
        } else {
            None
        };

        // Resolve the test id set: failing view, then caller ids, then
        // single-worker passthrough, then enumeration.
        let mut partial = false;
        let mut listpath = None;
        let test_ids: Option<BTreeMap<String, TestMeta>> = if options.failing_only {
            partial = true;
            listpath = Some(self.list_dir.join(FAILING_LIST));
            let mut tests: BTreeMap<String, TestMeta> = BTreeMap::new();
            for entry in self.repository.failing_entries()? {
                let meta = tests.entry(entry.id.clone()).or_default();
                if entry.profiles.is_empty() {
                    for profile in default_profiles {
                        meta.add_profile(profile);
                    }
                } else {
                    for profile in &entry.profiles {
                        meta.add_profile(profile);
                    }
                }
            }
            Some(tests)
        } else if let Some(ids) = &options.test_ids {
            partial = true;
            Some(ids.clone())
        } else if concurrency == 1 && options.filters.is_none() {
            None
        } else {
            Some(
                self.enumerate_tests(&template, default_profiles, source)
                    .await?,
            )
        };

        let test_ids = match (test_ids, &options.filters) {
            (Some(tests), Some(filters)) => {
                partial = true;
                Some(Self::filter_tests(tests, filters)?)
            }
            (tests, _) => tests,
        };

        let grouper: Option<RegexGroup> = match self.config.group_regex() {
            Some(pattern) => {
                Some(
                    RegexGroup::new(pattern).map_err(|e| QuarryError::BadConfigValue {
                        key: "group_regex",
                        reason: e.to_string(),
                    })?,
                )
            }
            None => None,
        };

        // One batch of work per (profile, partition).
        let mut batches: Vec<(String, Option<Vec<String>>)> = Vec::new();
        for profile in default_profiles {
            match &test_ids {
                None => batches.push((profile.clone(), None)),
                Some(tests) => {
                    let profile_ids: Vec<String> = tests
                        .iter()
                        .filter(|(_, meta)| meta.profiles.iter().any(|p| p == profile))
                        .map(|(id, _)| id.clone())
                        .collect();
                    if profile_ids.is_empty() {
                        continue;
                    }
                    let timing = self.repository.get_test_times(&profile_ids)?;
                    let partitions = partition_tests(
                        &profile_ids,
                        concurrency,
                        &timing,
                        grouper.as_ref().map(|g| g as &dyn GroupOf),
                    );
                    for partition in partitions {
                        if !partition.is_empty() {
                            batches.push((profile.clone(), Some(partition)));
                        }
                    }
                }
            }
        }

        self.ui
            .on_tests_scheduled(test_ids.as_ref().map(BTreeMap::len));

        let declared: BTreeSet<String> = default_profiles.clone();
        let mut inserter = self.repository.get_inserter(partial, declared)?;
        inserter.start();
        let drive_result = self
            .drive(
                &mut *inserter,
                batches,
                &template,
                idoption_template.as_deref(),
                listpath,
                source,
            )
            .await;
        let stop_result = inserter.stop();

        let events = drive_result?;
        let run_id = stop_result?;

        let summary = RunSummary::from_events(&events, &self.config.filter_tags());
        self.ui.on_run_complete(&summary);
        info!(
            run_id,
            tests = summary.tests_run,
            failures = summary.failures,
            "run recorded"
        );
        Ok(if summary.successful() { 0 } else { 1 })
    }

    /// Spawns every batch as a worker, fans their event streams into the
    /// inserter and the UI, then reaps workers and their instances.
    async fn drive(
        &self,
        inserter: &mut dyn Inserter,
        batches: Vec<(String, Option<Vec<String>>)>,
        template: &str,
        idoption_template: Option<&str>,
        listpath: Option<PathBuf>,
        source: &mut InstanceSource<'_>,
    ) -> Result<Vec<TestEvent>, QuarryError> {
        let run_cancel = self.cancel.child_token();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handles: Vec<WorkerHandle> = Vec::new();
        let mut spawn_error = None;

        for (profile, ids) in batches {
            let spawned = self
                .spawn_worker(
                    &profile,
                    ids,
                    template,
                    idoption_template,
                    listpath.as_deref(),
                    &tx,
                    &run_cancel,
                    source,
                )
                .await;
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Abort the workers already running, but keep their
                    // output: the failure path still commits partial data.
                    spawn_error = Some(e);
                    run_cancel.cancel();
                    break;
                }
            }
        }
        drop(tx);

        let mut events = Vec::new();
        while let Some(mut event) = rx.recv().await {
            if event.timestamp.is_none() {
                event.timestamp = Some(Utc::now());
            }
            self.ui.on_test_event(&event);
            inserter.status(event.clone());
            events.push(event);
        }

        let exit_codes: Vec<i32> =
            futures::future::join_all(handles.iter_mut().map(|handle| &mut handle.task))
                .await
                .into_iter()
                .map(|joined| joined.unwrap_or(-1))
                .collect();

        let mut cleanup_error: Option<QuarryError> = None;
        for (handle, exit_code) in handles.iter().zip(exit_codes) {
            debug!(profile = %handle.profile, exit_code, "worker finished");
            if let Some(instance) = &handle.instance {
                if let Err(e) = source.release_instance(instance) {
                    cleanup_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = spawn_error {
            return Err(e);
        }
        if let Some(e) = cleanup_error {
            return Err(e);
        }
        Ok(events)
    }

    #[allow(clippy::too_many_arguments)]
    async fn spawn_worker(
        &self,
        profile: &str,
        ids: Option<Vec<String>>,
        template: &str,
        idoption_template: Option<&str>,
        listpath: Option<&std::path::Path>,
        tx: &mpsc::UnboundedSender<TestEvent>,
        cancel: &CancellationToken,
        source: &mut InstanceSource<'_>,
    ) -> Result<WorkerHandle, QuarryError> {
        let instance = source.obtain_instance(profile).await?;
        let release_on_error = |source: &mut InstanceSource<'_>, instance: &Option<Instance>| {
            if let Some(instance) = instance {
                let _ = source.release_instance(instance);
            }
        };

        let built = match worker::build_run_command(
            template,
            idoption_template,
            self.config.test_id_list_default().unwrap_or(""),
            profile,
            ids.as_deref(),
            listpath,
            instance.as_ref(),
            self.config.instance_execute(),
        ) {
            Ok(built) => built,
            Err(e) => {
                release_on_error(source, &instance);
                return Err(e);
            }
        };
        self.ui.output_values(&[("running", built.command.clone())]);
        let child = match self.connector.spawn(&built.command) {
            Ok(child) => child,
            Err(e) => {
                release_on_error(source, &instance);
                return Err(e.into());
            }
        };
        let profile_tag = (profile != DEFAULT_PROFILE).then(|| profile.to_string());
        let task = tokio::spawn(worker::pump_worker(
            child,
            profile_tag,
            cancel.clone(),
            tx.clone(),
            built.list_file,
        ));
        Ok(WorkerHandle {
            profile: profile.to_string(),
            instance,
            task,
        })
    }
}
