//! Worker command construction and event pumping.
//!
//! A worker is one spawned test backend: its command line is the
//! `test_command` template with the id variables filled in, optionally
//! wrapped by `instance_execute` to run inside a provisioned environment.
//! Once spawned, [`pump_worker`] owns the child's stdout: it decodes the
//! subunit stream, forwards events to the controller, and converts a
//! silent non-zero exit into an explicit failure event.

use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::QuarryError;
use crate::instance::Instance;
use crate::subst::expand;
use crate::subunit::{StreamDecoder, TestEvent, TestStatus};
use crate::testlist::write_list;

/// Synthetic test id reporting a worker that died without failing tests.
pub const RETURNCODE_TEST_ID: &str = "process-returncode";

/// A test id list written for `$IDFILE`.
///
/// Unique temp files clean themselves up; the fixed `failing.list` path is
/// removed when the worker finishes.
pub(crate) enum ListFile {
    Temp(tempfile::TempPath),
    Fixed(PathBuf),
}

impl ListFile {
    pub(crate) fn path(&self) -> &Path {
        match self {
            ListFile::Temp(path) => path,
            ListFile::Fixed(path) => path,
        }
    }
}

impl Drop for ListFile {
    fn drop(&mut self) {
        // The fixed failing.list path is shared between a run's workers, so
        // a second removal may find it already gone.
        if let ListFile::Fixed(path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

fn write_list_file(ids: &[String], listpath: Option<&Path>) -> std::io::Result<ListFile> {
    match listpath {
        Some(path) => {
            let mut file = std::fs::File::create(path)?;
            write_list(&mut file, ids)?;
            file.flush()?;
            Ok(ListFile::Fixed(path.to_path_buf()))
        }
        None => {
            let mut file = tempfile::NamedTempFile::new()?;
            write_list(&mut file, ids)?;
            file.flush()?;
            Ok(ListFile::Temp(file.into_temp_path()))
        }
    }
}

/// A fully substituted worker invocation.
pub(crate) struct WorkerCommand {
    pub command: String,
    pub list_file: Option<ListFile>,
}

/// Builds the command for one worker.
///
/// With `test_ids` absent the backend picks its own tests: `$IDLIST` falls
/// back to `default_idlist` (the `test_id_list_default` key) and the other
/// id variables expand empty. `$LISTOPT` always expands empty here; it is
/// only populated during enumeration.
pub(crate) fn build_run_command(
    template: &str,
    idoption_template: Option<&str>,
    default_idlist: &str,
    profile: &str,
    test_ids: Option<&[String]>,
    listpath: Option<&Path>,
    instance: Option<&Instance>,
    instance_execute: Option<&str>,
) -> Result<WorkerCommand, QuarryError> {
    let mut list_file = None;
    let mut idfile = String::new();
    let mut idlist = default_idlist.to_string();
    let mut idoption = String::new();
    if let Some(ids) = test_ids {
        let written = write_list_file(ids, listpath)?;
        idfile = written.path().display().to_string();
        list_file = Some(written);
        idlist = ids.join(" ");
        if let Some(option) = idoption_template {
            idoption = expand(option, &[("IDFILE", &idfile)]);
        }
    }
    let command = expand(
        template,
        &[
            ("IDFILE", &idfile),
            ("IDLIST", &idlist),
            ("IDOPTION", &idoption),
            ("LISTOPT", ""),
            ("PROFILE", profile),
        ],
    );
    let command = instance_wrap(
        command,
        instance,
        instance_execute,
        profile,
        list_file.as_ref().map(ListFile::path),
    );
    Ok(WorkerCommand { command, list_file })
}

/// Wraps `command` in the `instance_execute` template when the worker was
/// given an instance.
pub(crate) fn instance_wrap(
    command: String,
    instance: Option<&Instance>,
    template: Option<&str>,
    profile: &str,
    files: Option<&Path>,
) -> String {
    match (instance, template) {
        (Some(instance), Some(template)) => expand(
            template,
            &[
                ("INSTANCE_ID", instance.id()),
                ("PROFILE", profile),
                ("COMMAND", &command),
                (
                    "FILES",
                    &files.map(|p| p.display().to_string()).unwrap_or_default(),
                ),
            ],
        ),
        _ => command,
    }
}

fn drain(
    decoder: &mut StreamDecoder,
    profile_tag: &Option<String>,
    saw_fail: &mut bool,
    tx: &mpsc::UnboundedSender<TestEvent>,
) {
    while let Some(mut event) = decoder.next_event() {
        if let (Some(tag), true) = (profile_tag, event.id.is_some()) {
            event.tags.insert(tag.clone());
        }
        if event.status == Some(TestStatus::Fail) {
            *saw_fail = true;
        }
        // The receiver only closes once every worker is done; a send can
        // only fail during teardown, when events have nowhere to go anyway.
        let _ = tx.send(event);
    }
}

/// Pumps one worker's stdout into the event channel until it exits.
///
/// Returns the worker's exit code. Cancellation kills the child and keeps
/// draining until the pipe closes so partial results are preserved. A
/// non-zero exit with no failure seen synthesises an
/// [`RETURNCODE_TEST_ID`] failure carrying a `traceback` attachment of
/// `returncode N`.
pub(crate) async fn pump_worker(
    mut child: Child,
    profile_tag: Option<String>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<TestEvent>,
    list_file: Option<ListFile>,
) -> i32 {
    let mut decoder = StreamDecoder::new();
    let mut saw_fail = false;
    let mut killed = false;

    if let Some(mut stdout) = child.stdout.take() {
        let mut buf = vec![0u8; 8192];
        loop {
            tokio::select! {
                _ = cancel.cancelled(), if !killed => {
                    killed = true;
                    debug!("interrupt: killing worker");
                    let _ = child.start_kill();
                }
                read = stdout.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            decoder.feed(&buf[..n]);
                            drain(&mut decoder, &profile_tag, &mut saw_fail, &tx);
                        }
                    }
                }
            }
        }
    }
    decoder.mark_eof();
    drain(&mut decoder, &profile_tag, &mut saw_fail, &tx);

    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(-1),
        Err(e) => {
            warn!("waiting for worker failed: {}", e);
            -1
        }
    };

    if exit_code != 0 && !saw_fail && !killed {
        let tag = profile_tag.iter().cloned();
        let _ = tx.send(
            TestEvent::new(RETURNCODE_TEST_ID, TestStatus::InProgress).with_tags(tag.clone()),
        );
        let _ = tx.send(
            TestEvent::new(RETURNCODE_TEST_ID, TestStatus::Fail)
                .with_file("traceback", format!("returncode {exit_code}").into_bytes())
                .with_mime("text/plain;charset=utf8")
                .with_tags(tag),
        );
    }

    drop(list_file);
    exit_code
}
