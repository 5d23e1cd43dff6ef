//! Family graph reconciliation CLI.
//!
//! Provides the `kinmerge` binary. `analyze` and `plan` work on two tree
//! files without touching a store. `import`, `state`, `history`, and
//! `lookup` open the SQLite store named by `--db` (or `KINMERGE_DB_PATH`).
//!
//! Results are printed to stdout as JSON. Exit codes: 0 = success,
//! 1 = rejected input, 2 = merge blocked by conflicts, 3 = I/O or store
//! failure.

mod offline;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use kinmerge_core::{FamilyCode, SourceTree};
use kinmerge_service::config::parse_weights;
use kinmerge_service::{lookup_user_by_phone, AppState, MergeService, ServiceConfig};
use kinmerge_storage::{MergeRequestId, MergeStore, SqliteStore};

use crate::offline::CliError;

/// Family tree reconciliation tools.
#[derive(Parser)]
#[command(name = "kinmerge", about = "Family tree reconciliation tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Matching overrides shared by `analyze` and `plan`.
#[derive(clap::Args)]
struct MatchArgs {
    /// Primary tree JSON file.
    #[arg(short, long)]
    primary: PathBuf,

    /// Secondary tree JSON file.
    #[arg(short, long)]
    secondary: PathBuf,

    /// Generation offset applied to the secondary tree.
    #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
    offset: i32,

    /// Minimum confidence (0-100) for a match to be surfaced.
    #[arg(short, long)]
    threshold: Option<u8>,

    /// Field weights as `name,birth,gender,generation`.
    #[arg(long)]
    weights: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Match and classify two tree files.
    Analyze {
        #[command(flatten)]
        args: MatchArgs,
    },

    /// Accept every surfaced match and print the merged tree.
    Plan {
        #[command(flatten)]
        args: MatchArgs,

        /// Plan even when hard conflicts or critical crises are present.
        #[arg(long)]
        force: bool,
    },

    /// Store a tree file as the tree of a family.
    Import {
        #[arg(long)]
        db: Option<String>,

        #[arg(short, long)]
        family: String,

        #[arg(short = 'F', long)]
        file: PathBuf,
    },

    /// Print the current state of a merge request.
    State {
        #[arg(long)]
        db: Option<String>,

        #[arg(short, long)]
        merge: i64,
    },

    /// Print the history of a merge request, oldest first.
    History {
        #[arg(long)]
        db: Option<String>,

        #[arg(short, long)]
        merge: i64,
    },

    /// Look up a registered user by phone number.
    Lookup {
        #[arg(long)]
        db: Option<String>,

        phone: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli.command).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            e.exit_code()
        }
    };
    process::exit(code);
}

async fn run(command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Analyze { args } => {
            let config = service_config(&args)?;
            let primary = offline::read_tree(&args.primary, SourceTree::Primary)?;
            let secondary = offline::read_tree(&args.secondary, SourceTree::Secondary)?;
            let report = offline::analyze(&primary, &secondary, args.offset, &config.engine)?;
            print_json(&report)
        }
        Commands::Plan { args, force } => {
            let config = service_config(&args)?;
            let primary = offline::read_tree(&args.primary, SourceTree::Primary)?;
            let secondary = offline::read_tree(&args.secondary, SourceTree::Secondary)?;
            let result = offline::plan(&primary, &secondary, args.offset, &config.engine, force)?;
            print_json(&result)
        }
        Commands::Import { db, family, file } => {
            let snapshot = offline::read_snapshot(&file)?;
            let state = open_store(db)?;
            let family = FamilyCode::new(family);
            let people = snapshot.people.len();
            let code = family.clone();
            state
                .with_store(move |store| store.save_tree(&code, &snapshot))
                .await?;
            tracing::info!("imported {} person(s) into family {}", people, family);
            Ok(())
        }
        Commands::State { db, merge } => {
            let service = MergeService::new(open_store(db)?);
            let request = service.get_state(MergeRequestId(merge)).await?;
            print_json(&request)
        }
        Commands::History { db, merge } => {
            let service = MergeService::new(open_store(db)?);
            let history = service.get_history(MergeRequestId(merge)).await?;
            print_json(&history)
        }
        Commands::Lookup { db, phone } => {
            let state = open_store(db)?;
            let found = lookup_user_by_phone(&state, &phone).await?;
            print_json(&found)
        }
    }
}

/// Environment configuration with command-line overrides applied.
fn service_config(args: &MatchArgs) -> Result<ServiceConfig, CliError> {
    let mut config = ServiceConfig::from_env()?;
    if let Some(threshold) = args.threshold {
        if threshold > 100 {
            return Err(CliError::Service(kinmerge_service::ServiceError::Validation(
                format!("threshold {} is above 100", threshold),
            )));
        }
        config.engine.matcher.threshold = threshold;
    }
    if let Some(raw) = &args.weights {
        config.engine.matcher.weights = parse_weights(raw)?;
    }
    Ok(config)
}

fn open_store(db: Option<String>) -> Result<AppState<SqliteStore>, CliError> {
    let mut config = ServiceConfig::from_env()?;
    if let Some(path) = db {
        config.db_path = path;
    }
    ensure_parent_dir(Path::new(&config.db_path))?;
    Ok(AppState::open(config)?)
}

fn ensure_parent_dir(path: &Path) -> Result<(), CliError> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => {
            std::fs::create_dir_all(dir).map_err(|source| CliError::Io {
                path: dir.display().to_string(),
                source,
            })
        }
        _ => Ok(()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| CliError::Parse {
        path: "<stdout>".to_string(),
        source,
    })?;
    println!("{}", json);
    Ok(())
}
