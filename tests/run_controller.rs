//! End-to-end runs through the controller with real shell workers.
//!
//! Workers are `sh` fragments that replay pre-encoded subunit streams, so
//! the full path from config through enumeration, partitioning, spawning
//! and decoding to repository ingestion is exercised without any real
//! test framework.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use quarry::config::TestConfig;
use quarry::connector::ShellConnector;
use quarry::orchestrator::{RunController, RunOptions, RETURNCODE_TEST_ID};
use quarry::repository::file::FileRepository;
use quarry::repository::Repository;
use quarry::subunit::{encode_events, TestEvent, TestStatus};
use quarry::ui::MemoryUi;

struct Project {
    dir: TempDir,
    repo: FileRepository,
}

impl Project {
    fn new(config: &str) -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".quarry.conf"), config).unwrap();
        let repo = FileRepository::initialise(dir.path()).unwrap();
        Project { dir, repo }
    }

    fn write_stream(&self, name: &str, events: &[TestEvent]) {
        fs::write(self.dir.path().join(name), encode_events(events).unwrap()).unwrap();
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

async fn run(project: &Project, ui: &MemoryUi, options: RunOptions) -> i32 {
    let config = TestConfig::load(project.path()).unwrap();
    let connector = ShellConnector::new().with_working_dir(project.path().to_path_buf());
    let controller = RunController::new(
        config,
        &project.repo,
        ui,
        &connector,
        project.repo.path().to_path_buf(),
    );
    controller.run(&options).await.unwrap()
}

fn one_worker() -> RunOptions {
    RunOptions {
        concurrency: Some(1),
        ..RunOptions::default()
    }
}

#[tokio::test]
async fn single_worker_run_records_results() {
    let project = Project::new("[DEFAULT]\ntest_command=cat stream\n");
    project.write_stream(
        "stream",
        &[
            TestEvent::new("ok", TestStatus::InProgress),
            TestEvent::new("ok", TestStatus::Success),
            TestEvent::new("bad", TestStatus::InProgress),
            TestEvent::new("bad", TestStatus::Fail),
        ],
    );
    let ui = MemoryUi::new();
    let code = run(&project, &ui, one_worker()).await;

    assert_eq!(code, 1);
    assert_eq!(project.repo.count().unwrap(), 1);
    assert_eq!(
        project.repo.get_failing().unwrap().test_ids(),
        vec!["bad".to_string()]
    );
    // Ingestion stamped timestamps, so timing data exists.
    let times = project
        .repo
        .get_test_times(&["ok".to_string()])
        .unwrap();
    assert!(times.known.contains_key("ok"));
    let summary = &ui.summaries.lock().unwrap()[0];
    assert_eq!(summary.tests_run, 2);
    assert_eq!(summary.failures, 1);
}

#[tokio::test]
async fn all_passing_run_exits_zero() {
    let project = Project::new("[DEFAULT]\ntest_command=cat stream\n");
    project.write_stream(
        "stream",
        &[
            TestEvent::new("ok", TestStatus::InProgress),
            TestEvent::new("ok", TestStatus::Success),
        ],
    );
    let ui = MemoryUi::new();
    assert_eq!(run(&project, &ui, one_worker()).await, 0);
}

#[tokio::test]
async fn nonzero_worker_exit_synthesises_failure() {
    let project = Project::new("[DEFAULT]\ntest_command=cat stream && exit 2\n");
    project.write_stream(
        "stream",
        &[
            TestEvent::new("foo", TestStatus::InProgress),
            TestEvent::new("foo", TestStatus::Success),
        ],
    );
    let ui = MemoryUi::new();
    let code = run(&project, &ui, one_worker()).await;

    assert_eq!(code, 1);
    let entries = project.repo.failing_entries().unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.id, RETURNCODE_TEST_ID);
    assert_eq!(
        entry.details.get("traceback").map(Vec::as_slice),
        Some(b"returncode 2".as_slice())
    );
    // foo itself passed and is recorded as such.
    let run = project.repo.get_latest_run().unwrap();
    assert!(run
        .outcomes()
        .iter()
        .any(|(id, status)| id == "foo" && *status == TestStatus::Success));
}

#[tokio::test]
async fn enumeration_partitions_across_workers() {
    let project = Project::new(
        "[DEFAULT]\ntest_command=cat stream$LISTOPT\ntest_list_option=.enum\n",
    );
    project.write_stream(
        "stream.enum",
        &[
            TestEvent::new("t1", TestStatus::Exists),
            TestEvent::new("t2", TestStatus::Exists),
        ],
    );
    project.write_stream(
        "stream",
        &[
            TestEvent::new("t1", TestStatus::Success),
            TestEvent::new("t2", TestStatus::Success),
        ],
    );
    let ui = MemoryUi::new();
    let options = RunOptions {
        concurrency: Some(2),
        ..RunOptions::default()
    };
    let code = run(&project, &ui, options).await;

    assert_eq!(code, 0);
    assert!(project.repo.get_failing().unwrap().test_ids().is_empty());
    // Two workers were spawned on top of the enumeration callout.
    let running: Vec<String> = ui
        .values
        .lock()
        .unwrap()
        .iter()
        .filter(|(label, _)| label == "running")
        .map(|(_, cmd)| cmd.clone())
        .collect();
    assert_eq!(running.iter().filter(|c| c.contains(".enum")).count(), 1);
    assert_eq!(running.iter().filter(|c| !c.contains(".enum")).count(), 2);
}

#[tokio::test]
async fn filters_make_the_run_partial() {
    let project = Project::new("[DEFAULT]\ntest_command=cat stream1\n");
    project.write_stream(
        "stream1",
        &[
            TestEvent::new("t1", TestStatus::Success),
            TestEvent::new("t2", TestStatus::Fail),
        ],
    );
    let ui = MemoryUi::new();
    assert_eq!(run(&project, &ui, one_worker()).await, 1);

    // Re-run only t1 with a filter; t2 must stay failing.
    let project2_conf =
        "[DEFAULT]\ntest_command=cat stream2$LISTOPT\ntest_list_option=.enum\n";
    fs::write(project.path().join(".quarry.conf"), project2_conf).unwrap();
    project.write_stream(
        "stream2.enum",
        &[
            TestEvent::new("t1", TestStatus::Exists),
            TestEvent::new("t2", TestStatus::Exists),
        ],
    );
    project.write_stream("stream2", &[TestEvent::new("t1", TestStatus::Success)]);
    let options = RunOptions {
        concurrency: Some(1),
        filters: Some(vec!["t1".to_string()]),
        ..RunOptions::default()
    };
    let code = run(&project, &ui, options).await;
    assert_eq!(code, 0);
    assert_eq!(
        project.repo.get_failing().unwrap().test_ids(),
        vec!["t2".to_string()]
    );
}

#[tokio::test]
async fn profiles_run_separately_and_tag_results() {
    let project = Project::new(
        "[DEFAULT]\ntest_command=cat $PROFILE-stream\nlist_profiles=echo p1 p2\n",
    );
    project.write_stream("p1-stream", &[TestEvent::new("a", TestStatus::Success)]);
    project.write_stream("p2-stream", &[TestEvent::new("b", TestStatus::Fail)]);
    let ui = MemoryUi::new();
    let code = run(&project, &ui, one_worker()).await;

    assert_eq!(code, 1);
    let entries = project.repo.failing_entries().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, "b");
    assert_eq!(entries[0].profiles, ["p2".to_string()].into());
}

#[tokio::test]
async fn instances_wrap_workers_and_are_disposed() {
    let project = Project::new(
        "[DEFAULT]\n\
         test_command=cat stream\n\
         instance_provision=echo box-a box-b\n\
         instance_execute=env WORKER=$INSTANCE_ID $COMMAND\n\
         instance_dispose=echo $INSTANCE_IDS > disposed.txt\n",
    );
    project.write_stream("stream", &[TestEvent::new("t", TestStatus::Success)]);
    let ui = MemoryUi::new();
    let code = run(&project, &ui, one_worker()).await;

    assert_eq!(code, 0);
    let disposed = fs::read_to_string(project.path().join("disposed.txt")).unwrap();
    assert_eq!(disposed.trim(), "box-a box-b");
    let running: Vec<String> = ui
        .values
        .lock()
        .unwrap()
        .iter()
        .filter(|(label, _)| label == "running")
        .map(|(_, cmd)| cmd.clone())
        .collect();
    assert!(running.iter().any(|c| c.starts_with("env WORKER=box-")));
}

#[tokio::test]
async fn until_failure_repeats_until_a_run_fails() {
    let project = Project::new("[DEFAULT]\ntest_command=sh runner.sh\n");
    // First invocation passes and drops a flag; the second fails.
    fs::write(
        project.path().join("runner.sh"),
        "if [ -f flag ]; then cat fail-stream; else touch flag; cat ok-stream; fi\n",
    )
    .unwrap();
    project.write_stream("ok-stream", &[TestEvent::new("t", TestStatus::Success)]);
    project.write_stream("fail-stream", &[TestEvent::new("t", TestStatus::Fail)]);
    let ui = MemoryUi::new();
    let options = RunOptions {
        concurrency: Some(1),
        until_failure: true,
        ..RunOptions::default()
    };
    let code = run(&project, &ui, options).await;

    assert_eq!(code, 1);
    assert_eq!(project.repo.count().unwrap(), 2);
}

#[tokio::test]
async fn failing_only_reruns_just_the_failing_set() {
    let project = Project::new("[DEFAULT]\ntest_command=cat stream1\n");
    project.write_stream(
        "stream1",
        &[
            TestEvent::new("good", TestStatus::Success),
            TestEvent::new("flaky", TestStatus::Fail),
        ],
    );
    let ui = MemoryUi::new();
    assert_eq!(run(&project, &ui, one_worker()).await, 1);

    // The rerun command records the ids it was given, then replays a pass
    // for the failing test.
    fs::write(
        project.path().join(".quarry.conf"),
        "[DEFAULT]\ntest_command=echo $IDLIST > rerun-ids.txt && cat stream2\n",
    )
    .unwrap();
    project.write_stream("stream2", &[TestEvent::new("flaky", TestStatus::Success)]);
    let options = RunOptions {
        concurrency: Some(1),
        failing_only: true,
        ..RunOptions::default()
    };
    let code = run(&project, &ui, options).await;
    assert_eq!(code, 0);
    assert!(project.repo.get_failing().unwrap().test_ids().is_empty());
    // Only the failing test was handed to the worker.
    let rerun_ids = fs::read_to_string(project.path().join("rerun-ids.txt")).unwrap();
    assert_eq!(rerun_ids.trim(), "flaky");
    // The partial rerun did not sweep `good` out of the history.
    assert_eq!(project.repo.count().unwrap(), 2);
    // The fixed list file was cleaned up afterwards.
    assert!(!project.repo.path().join("failing.list").exists());
}

#[tokio::test]
async fn missing_test_command_is_a_config_error() {
    let project = Project::new("[DEFAULT]\ntest_id_option=--load-list $IDFILE\n");
    let ui = MemoryUi::new();
    let config = TestConfig::load(project.path()).unwrap();
    let connector = ShellConnector::new().with_working_dir(project.path().to_path_buf());
    let controller = RunController::new(
        config,
        &project.repo,
        &ui,
        &connector,
        project.repo.path().to_path_buf(),
    );
    let err = controller.run(&one_worker()).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn bad_concurrency_callout_is_a_config_error() {
    let project = Project::new(
        "[DEFAULT]\ntest_command=cat stream\ntest_run_concurrency=echo nonsense\n",
    );
    project.write_stream("stream", &[TestEvent::new("t", TestStatus::Success)]);
    let ui = MemoryUi::new();
    let config = TestConfig::load(project.path()).unwrap();
    let connector = ShellConnector::new().with_working_dir(project.path().to_path_buf());
    let controller = RunController::new(
        config,
        &project.repo,
        &ui,
        &connector,
        project.repo.path().to_path_buf(),
    );
    let err = controller.run(&RunOptions::default()).await.unwrap_err();
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn failed_enumeration_surfaces_output_and_errors() {
    let project = Project::new(
        "[DEFAULT]\ntest_command=cat stream$LISTOPT\ntest_list_option=.enum\n",
    );
    // No stream.enum file: the enumeration `cat` fails.
    project.write_stream("stream", &[TestEvent::new("t", TestStatus::Success)]);
    let ui = MemoryUi::new();
    let config = TestConfig::load(project.path()).unwrap();
    let connector = ShellConnector::new().with_working_dir(project.path().to_path_buf());
    let controller = RunController::new(
        config,
        &project.repo,
        &ui,
        &connector,
        project.repo.path().to_path_buf(),
    );
    let options = RunOptions {
        concurrency: Some(2),
        ..RunOptions::default()
    };
    let err = controller.run(&options).await.unwrap_err();
    assert_eq!(err.exit_code(), 1);
    // stderr from the failed listing reached the UI.
    let streams = ui.streams.lock().unwrap();
    assert!(streams
        .iter()
        .any(|bytes| String::from_utf8_lossy(bytes).contains("stream.enum")));
}

#[tokio::test]
async fn list_tests_enumerates_and_filters() {
    let project = Project::new(
        "[DEFAULT]\ntest_command=cat stream$LISTOPT\ntest_list_option=.enum\n",
    );
    project.write_stream(
        "stream.enum",
        &[
            TestEvent::new("mod.test_a", TestStatus::Exists),
            TestEvent::new("mod.test_b", TestStatus::Exists),
            TestEvent::new("other.test_c", TestStatus::Exists),
        ],
    );
    let ui = MemoryUi::new();
    let config = TestConfig::load(project.path()).unwrap();
    let connector = ShellConnector::new().with_working_dir(project.path().to_path_buf());
    let controller = RunController::new(
        config,
        &project.repo,
        &ui,
        &connector,
        project.repo.path().to_path_buf(),
    );
    let all = controller.list_tests(None).await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(
        all["mod.test_a"].profiles,
        vec!["DEFAULT".to_string()],
    );
    let filtered = controller
        .list_tests(Some(&["^mod".to_string()]))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 2);
    let code = quarry::commands::list_tests(&ui, &filtered, quarry::ui::ListStyle::Lines).unwrap();
    assert_eq!(code, 0);
    let listings = ui.listings.lock().unwrap();
    assert_eq!(listings[0], "mod.test_a [DEFAULT]\nmod.test_b [DEFAULT]\n");
}

#[tokio::test]
async fn group_regex_keeps_groups_on_one_worker() {
    // Each worker appends the id list it was given to a shared log; the
    // `grp.` tests must arrive together on a single worker.
    let project = Project::new(
        "[DEFAULT]\n\
         test_command=echo [$IDLIST] >> batches.txt && cat stream$LISTOPT\n\
         test_list_option=.enum\n\
         group_regex=grp\\.\n",
    );
    project.write_stream(
        "stream.enum",
        &[
            TestEvent::new("grp.one", TestStatus::Exists),
            TestEvent::new("grp.two", TestStatus::Exists),
            TestEvent::new("solo", TestStatus::Exists),
        ],
    );
    project.write_stream(
        "stream",
        &[
            TestEvent::new("grp.one", TestStatus::Success),
            TestEvent::new("grp.two", TestStatus::Success),
            TestEvent::new("solo", TestStatus::Success),
        ],
    );
    let ui = MemoryUi::new();
    let options = RunOptions {
        concurrency: Some(2),
        ..RunOptions::default()
    };
    let code = run(&project, &ui, options).await;
    assert_eq!(code, 0);

    let batches = fs::read_to_string(project.path().join("batches.txt")).unwrap();
    assert!(batches.lines().any(|l| l.contains("grp.one grp.two")));
    assert!(batches.lines().any(|l| l == "[solo]"));
}
