//! User interface seam.
//!
//! The orchestrator and commands never print directly; they talk to a
//! [`Ui`]. The console implementation renders progress and summaries for
//! humans, the memory implementation captures everything for assertions.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::subunit::{TestEvent, TestStatus};

/// Metadata kept per test id: the profiles the test runs under, sorted for
/// deterministic output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TestMeta {
    pub profiles: Vec<String>,
}

impl TestMeta {
    pub fn add_profile(&mut self, profile: &str) {
        if let Err(at) = self.profiles.binary_search_by(|p| p.as_str().cmp(profile)) {
            self.profiles.insert(at, profile.to_string());
        }
    }
}

/// Rendering style for test listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStyle {
    Lines,
    Json,
}

/// Aggregated counts for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub tests_run: usize,
    pub failures: usize,
    pub skips: usize,
    pub xfails: usize,
    pub uxsuccesses: usize,
    pub duration: Option<Duration>,
}

impl RunSummary {
    /// Computes a summary from a run's events.
    ///
    /// Tests whose final event carries one of `filter_tags` are excluded
    /// from the run count, but still counted when they failed: stripping
    /// infrastructure results must never hide a failure.
    pub fn from_events(
        events: &[TestEvent],
        filter_tags: &std::collections::BTreeSet<String>,
    ) -> Self {
        let mut last: BTreeMap<&str, &TestEvent> = BTreeMap::new();
        for event in events {
            let (Some(id), Some(status)) = (&event.id, event.status) else {
                continue;
            };
            if status.is_terminal() {
                last.insert(id, event);
            }
        }
        let mut summary = RunSummary::default();
        for event in last.values() {
            let status = event.status.expect("terminal events retained");
            let filtered = event.tags.iter().any(|tag| filter_tags.contains(tag));
            if filtered && !status.is_failure() {
                continue;
            }
            summary.tests_run += 1;
            match status {
                TestStatus::Fail => summary.failures += 1,
                TestStatus::UxSuccess => {
                    summary.uxsuccesses += 1;
                    summary.failures += 1;
                }
                TestStatus::Skip => summary.skips += 1,
                TestStatus::XFail => summary.xfails += 1,
                _ => {}
            }
        }
        let start = events.iter().filter_map(|e| e.timestamp).min();
        let end = events.iter().filter_map(|e| e.timestamp).max();
        if let (Some(start), Some(end)) = (start, end) {
            summary.duration = (end - start).to_std().ok();
        }
        summary
    }

    pub fn successful(&self) -> bool {
        self.failures == 0
    }
}

/// Sink for everything the user sees.
pub trait Ui: Send + Sync {
    /// Echoes labelled values, e.g. `("running", cmd)`.
    fn output_values(&self, values: &[(&str, String)]);

    /// Writes raw bytes through unchanged (subunit passthrough).
    fn output_stream(&self, bytes: &[u8]) -> io::Result<()>;

    /// Renders a test listing in the requested style.
    fn output_tests_meta(
        &self,
        tests: &BTreeMap<String, TestMeta>,
        style: ListStyle,
    ) -> io::Result<()>;

    /// Announces how many tests were scheduled, `None` when the runner
    /// picks its own set.
    fn on_tests_scheduled(&self, total: Option<usize>);

    /// Receives each ingested event as the run progresses.
    fn on_test_event(&self, event: &TestEvent);

    /// Receives the final summary.
    fn on_run_complete(&self, summary: &RunSummary);
}

fn render_tests_meta(
    tests: &BTreeMap<String, TestMeta>,
    style: ListStyle,
) -> io::Result<String> {
    match style {
        ListStyle::Json => {
            let json = serde_json::to_string_pretty(tests).map_err(io::Error::other)?;
            Ok(format!("{json}\n"))
        }
        ListStyle::Lines => {
            let mut out = String::new();
            for (id, meta) in tests {
                if meta.profiles.is_empty() {
                    out.push_str(id);
                } else {
                    out.push_str(&format!("{id} [{}]", meta.profiles.join(", ")));
                }
                out.push('\n');
            }
            Ok(out)
        }
    }
}

/// Interactive console UI with a progress bar and styled summary.
pub struct ConsoleUi {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ConsoleUi {
    pub fn new(verbose: bool) -> Self {
        ConsoleUi {
            progress: Mutex::new(None),
            verbose,
        }
    }

    fn println(&self, line: String) {
        match self.progress.lock().expect("progress lock").as_ref() {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }
}

impl Ui for ConsoleUi {
    fn output_values(&self, values: &[(&str, String)]) {
        for (label, value) in values {
            self.println(format!("{label}: {value}"));
        }
    }

    fn output_stream(&self, bytes: &[u8]) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        stdout.write_all(bytes)?;
        stdout.flush()
    }

    fn output_tests_meta(
        &self,
        tests: &BTreeMap<String, TestMeta>,
        style: ListStyle,
    ) -> io::Result<()> {
        print!("{}", render_tests_meta(tests, style)?);
        Ok(())
    }

    fn on_tests_scheduled(&self, total: Option<usize>) {
        let bar = match total {
            Some(total) => {
                let bar = indicatif::ProgressBar::new(total as u64);
                bar.set_style(
                    indicatif::ProgressStyle::default_bar()
                        .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len}")
                        .expect("static template")
                        .progress_chars("#>-"),
                );
                bar
            }
            None => indicatif::ProgressBar::new_spinner(),
        };
        *self.progress.lock().expect("progress lock") = Some(bar);
    }

    fn on_test_event(&self, event: &TestEvent) {
        let (Some(id), Some(status)) = (&event.id, event.status) else {
            return;
        };
        if status.is_terminal() {
            if let Some(bar) = self.progress.lock().expect("progress lock").as_ref() {
                bar.inc(1);
            }
        }
        match status {
            TestStatus::Fail => self.println(format!("{} {id}", console::style("FAIL").red())),
            TestStatus::UxSuccess => {
                self.println(format!("{} {id}", console::style("UXPASS").red()))
            }
            TestStatus::Skip if self.verbose => {
                self.println(format!("{} {id}", console::style("SKIP").yellow()))
            }
            TestStatus::Success if self.verbose => {
                self.println(format!("{} {id}", console::style("PASS").green()))
            }
            _ => {}
        }
    }

    fn on_run_complete(&self, summary: &RunSummary) {
        if let Some(bar) = self.progress.lock().expect("progress lock").take() {
            bar.finish_and_clear();
        }
        let mut line = format!("Ran {} tests", summary.tests_run);
        if let Some(duration) = summary.duration {
            line.push_str(&format!(" in {:.3}s", duration.as_secs_f64()));
        }
        println!("{line}");
        if summary.successful() {
            println!("{}", console::style("PASSED").green().bold());
        } else {
            println!(
                "{} ({} failures)",
                console::style("FAILED").red().bold(),
                summary.failures
            );
        }
        if summary.skips > 0 {
            println!("  skips: {}", summary.skips);
        }
        if summary.xfails > 0 {
            println!("  expected failures: {}", summary.xfails);
        }
        if summary.uxsuccesses > 0 {
            println!("  unexpected successes: {}", summary.uxsuccesses);
        }
    }
}

/// Capturing UI for tests and embedding.
#[derive(Default)]
pub struct MemoryUi {
    pub values: Mutex<Vec<(String, String)>>,
    pub streams: Mutex<Vec<Vec<u8>>>,
    pub listings: Mutex<Vec<String>>,
    pub events: Mutex<Vec<TestEvent>>,
    pub summaries: Mutex<Vec<RunSummary>>,
}

impl MemoryUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value_for(&self, label: &str) -> Option<String> {
        self.values
            .lock()
            .expect("values lock")
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v.clone())
    }
}

impl Ui for MemoryUi {
    fn output_values(&self, values: &[(&str, String)]) {
        let mut store = self.values.lock().expect("values lock");
        store.extend(
            values
                .iter()
                .map(|(label, value)| (label.to_string(), value.clone())),
        );
    }

    fn output_stream(&self, bytes: &[u8]) -> io::Result<()> {
        self.streams.lock().expect("streams lock").push(bytes.to_vec());
        Ok(())
    }

    fn output_tests_meta(
        &self,
        tests: &BTreeMap<String, TestMeta>,
        style: ListStyle,
    ) -> io::Result<()> {
        let rendered = render_tests_meta(tests, style)?;
        self.listings.lock().expect("listings lock").push(rendered);
        Ok(())
    }

    fn on_tests_scheduled(&self, _total: Option<usize>) {}

    fn on_test_event(&self, event: &TestEvent) {
        self.events.lock().expect("events lock").push(event.clone());
    }

    fn on_run_complete(&self, summary: &RunSummary) {
        self.summaries
            .lock()
            .expect("summaries lock")
            .push(summary.clone());
    }
}
