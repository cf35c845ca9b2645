//! # quarry
//!
//! A parallel test-run orchestrator with a persistent result repository.
//!
//! Quarry drives external test processes, splits the work across parallel
//! workers and provisioned execution environments, ingests the resulting
//! subunit v2 event streams, and keeps a history of runs that can answer
//! "what is failing right now?" and "how long does each test take?".
//!
//! ## Overview
//!
//! The project under test describes how to run itself in `.quarry.conf`
//! (a `test_command` template plus optional callouts); quarry supplies:
//!
//! - **Partitioned parallel execution** balanced by recorded durations,
//!   with test-grouping constraints
//! - **Instance provisioning** via user-supplied shell commands, so
//!   workers can run in containers, VMs or remote hosts
//! - **A run repository** with a materialised view of currently failing
//!   tests, correct across partial runs and multiple profiles
//! - **Failing-first workflows**: rerun only what is broken, or loop a
//!   run until it fails
//!
//! ## Architecture
//!
//! The crate is organised around three subsystems:
//!
//! ### Repository ([`repository`])
//!
//! Append-only storage of runs with derived failing and timing views.
//! [`repository::file::FileRepository`] persists to a `.quarry` directory;
//! [`repository::memory::MemoryRepository`] backs tests and embedders.
//!
//! ### Orchestrator ([`orchestrator`])
//!
//! [`orchestrator::RunController`] resolves configuration, enumerates and
//! filters tests, partitions them with the [`scheduler`], spawns workers
//! through the [`connector`] inside instances from the
//! [`orchestrator::InstanceSource`], and fans the decoded event streams
//! into a repository inserter and the [`ui`].
//!
//! ### Wire format ([`subunit`])
//!
//! Workers speak subunit v2 on stdout. The codec tolerates interleaved
//! non-subunit output and is also the on-disk format for stored runs.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::collections::BTreeSet;
//! use std::path::Path;
//!
//! use quarry::config::TestConfig;
//! use quarry::connector::ShellConnector;
//! use quarry::orchestrator::{RunController, RunOptions};
//! use quarry::repository::file::FileRepository;
//! use quarry::ui::ConsoleUi;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let root = Path::new(".");
//!     let config = TestConfig::load(root)?;
//!     let repository = FileRepository::open(root)?;
//!     let ui = ConsoleUi::new(false);
//!     let connector = ShellConnector::new();
//!
//!     let list_dir = repository.path().to_path_buf();
//!     let controller = RunController::new(config, &repository, &ui, &connector, list_dir);
//!     let code = controller.run(&RunOptions::default()).await?;
//!     std::process::exit(code);
//! }
//! ```

pub mod commands;
pub mod config;
pub mod connector;
pub mod errors;
pub mod instance;
pub mod orchestrator;
pub mod repository;
pub mod scheduler;
pub mod subst;
pub mod subunit;
pub mod testlist;
pub mod ui;

// Re-export the types most embedders need.

pub use config::TestConfig;
pub use errors::QuarryError;
pub use instance::{Instance, InstancePool};
pub use orchestrator::{RunController, RunOptions};
pub use repository::{Repository, StoredRun};
pub use subunit::{TestEvent, TestStatus};
