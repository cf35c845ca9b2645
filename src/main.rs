//! quarry CLI - parallel test runner with a result repository.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use quarry::commands::{self, FailingMode};
use quarry::config::TestConfig;
use quarry::connector::ShellConnector;
use quarry::errors::QuarryError;
use quarry::orchestrator::{RunController, RunOptions};
use quarry::repository::file::FileRepository;
use quarry::ui::{ConsoleUi, ListStyle};

#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "Parallel test runner with a persistent result repository", long_about = None)]
#[command(version)]
struct Cli {
    /// Project root holding .quarry.conf and the repository
    #[arg(short = 'C', long, default_value = ".")]
    here: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialise a repository in the project root
    Init,

    /// Run tests and record the results
    Run {
        /// Run only the currently failing tests
        #[arg(long)]
        failing: bool,

        /// Repeat the run until it fails
        #[arg(long)]
        until_failure: bool,

        /// Override the worker count
        #[arg(long)]
        concurrency: Option<usize>,

        /// Regex filters: run only tests whose id matches one of them
        filters: Vec<String>,

        /// Extra arguments appended to the test command
        #[arg(last = true)]
        extra_args: Vec<String>,
    },

    /// Show the currently failing tests
    Failing {
        /// Emit the raw subunit stream
        #[arg(long)]
        subunit: bool,

        /// Show only a list of failing tests
        #[arg(long)]
        list: bool,

        /// Render the list as JSON
        #[arg(long)]
        json: bool,
    },

    /// Summarise the most recent run
    Last,

    /// Enumerate tests without running them
    ListTests {
        /// Regex filters applied to the listing
        filters: Vec<String>,

        /// Render the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load a subunit stream from stdin as a new run
    Load {
        /// Mark the run as covering only a subset of tests
        #[arg(long)]
        partial: bool,
    },
}

#[tokio::main]
async fn main() {
    let code = match dispatch().await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("error: {error:#}");
            exit_code_for(&error)
        }
    };
    std::process::exit(code);
}

fn exit_code_for(error: &anyhow::Error) -> i32 {
    if let Some(quarry) = error.downcast_ref::<QuarryError>() {
        return quarry.exit_code();
    }
    if error.downcast_ref::<quarry::config::ConfigError>().is_some() {
        return 3;
    }
    1
}

async fn dispatch() -> Result<i32> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init => init(&cli),
        Commands::Run {
            failing,
            until_failure,
            concurrency,
            ref filters,
            ref extra_args,
        } => {
            let options = RunOptions {
                test_ids: None,
                extra_args: extra_args.clone(),
                filters: if filters.is_empty() {
                    None
                } else {
                    Some(filters.clone())
                },
                concurrency,
                failing_only: failing,
                until_failure,
            };
            run(&cli, options).await
        }
        Commands::Failing {
            subunit,
            list,
            json,
        } => {
            let mode = if subunit {
                FailingMode::Stream
            } else if json {
                FailingMode::List(ListStyle::Json)
            } else if list {
                FailingMode::List(ListStyle::Lines)
            } else {
                FailingMode::Default
            };
            failing(&cli, mode).await
        }
        Commands::Last => last(&cli),
        Commands::ListTests { ref filters, json } => {
            list_tests(&cli, filters.clone(), json).await
        }
        Commands::Load { partial } => load(&cli, partial).await,
    }
}

fn init(cli: &Cli) -> Result<i32> {
    let repository = FileRepository::initialise(&cli.here)
        .with_context(|| format!("could not initialise repository in {}", cli.here.display()))?;
    println!("Initialised repository at {}", repository.path().display());
    Ok(0)
}

async fn run(cli: &Cli, options: RunOptions) -> Result<i32> {
    let config = TestConfig::load(&cli.here)?;
    let repository = FileRepository::open(&cli.here)?;
    let ui = ConsoleUi::new(cli.verbose);
    let connector = ShellConnector::new().with_working_dir(cli.here.clone());

    let list_dir = repository.path().to_path_buf();
    let controller = RunController::new(config, &repository, &ui, &connector, list_dir);

    // Interrupts kill the workers; partial results still land in the
    // repository and instances are disposed.
    let cancel = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let code = controller.run(&options).await?;
    Ok(code)
}

async fn failing(cli: &Cli, mode: FailingMode) -> Result<i32> {
    let config = TestConfig::load(&cli.here)?;
    let repository = FileRepository::open(&cli.here)?;
    let ui = ConsoleUi::new(cli.verbose);
    let connector = ShellConnector::new().with_working_dir(cli.here.clone());

    let list_dir = repository.path().to_path_buf();
    let controller = RunController::new(config, &repository, &ui, &connector, list_dir);
    let (profiles, _) = controller.resolve_profiles().await?;

    let code = commands::failing(&repository, &ui, &profiles, mode)?;
    Ok(code)
}

fn last(cli: &Cli) -> Result<i32> {
    let repository = FileRepository::open(&cli.here)?;
    let ui = ConsoleUi::new(cli.verbose);
    let code = commands::last(&repository, &ui)?;
    Ok(code)
}

async fn list_tests(cli: &Cli, filters: Vec<String>, json: bool) -> Result<i32> {
    let config = TestConfig::load(&cli.here)?;
    let repository = FileRepository::open(&cli.here)?;
    let ui = ConsoleUi::new(cli.verbose);
    let connector = ShellConnector::new().with_working_dir(cli.here.clone());

    let list_dir = repository.path().to_path_buf();
    let controller = RunController::new(config, &repository, &ui, &connector, list_dir);
    let filters = if filters.is_empty() {
        None
    } else {
        Some(filters)
    };
    let tests = controller.list_tests(filters.as_deref()).await?;
    let style = if json { ListStyle::Json } else { ListStyle::Lines };
    let code = commands::list_tests(&ui, &tests, style)?;
    Ok(code)
}

async fn load(cli: &Cli, partial: bool) -> Result<i32> {
    let repository = FileRepository::open(&cli.here)?;
    let ui = ConsoleUi::new(cli.verbose);

    // Profiles come from the config when there is one; a bare repository
    // still accepts streams.
    let profiles: BTreeSet<String> = match TestConfig::load(&cli.here) {
        Ok(config) => {
            let connector = ShellConnector::new().with_working_dir(cli.here.clone());
            let list_dir = repository.path().to_path_buf();
            let controller =
                RunController::new(config, &repository, &ui, &connector, list_dir);
            let (_, default_profiles) = controller.resolve_profiles().await?;
            default_profiles
        }
        Err(_) => BTreeSet::new(),
    };

    let mut stream = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut stream)
        .await
        .context("reading subunit stream from stdin")?;
    let code = commands::load(&repository, &ui, &stream, partial, profiles)?;
    Ok(code)
}
