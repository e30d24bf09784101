use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use harvest::catalog::migrate_legacy_catalog;
use harvest::{Error, Result, RuleId, SnapshotMetadata, StoreConfig, ValidationStatsService};
use serde::Serialize;

fn main() {
    // Initialize tracing subscriber to respect RUST_LOG environment variable
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = run() {
        eprintln!("harvest-admin: {err}");
        process::exit(1);
    }
}

#[derive(Parser)]
#[command(
    name = "harvest-admin",
    about = "Inspect and maintain harvest validation statistics and catalogs"
)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct StoreArgs {
    /// JSON store configuration file.
    #[arg(long, value_name = "FILE", conflicts_with = "base_path", global = true)]
    config: Option<PathBuf>,
    /// Storage root; all other options keep their defaults.
    #[arg(long = "base-path", value_name = "DIR", global = true)]
    base_path: Option<PathBuf>,
    /// Directory holding flat `snapshot_{id}.parquet` observation files.
    #[arg(long = "legacy-stats-path", value_name = "DIR", global = true)]
    legacy_stats_path: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct SnapshotArgs {
    /// Network acronym, e.g. "LA Referencia".
    #[arg(long)]
    network: String,
    /// Snapshot id.
    #[arg(long)]
    snapshot: i64,
}

#[derive(Subcommand)]
enum Command {
    /// Print rule statistics and facets as JSON.
    Stats {
        #[command(flatten)]
        snapshot: SnapshotArgs,
        /// Filter expression (`field:value`), repeatable.
        #[arg(long = "filter", short = 'f')]
        filters: Vec<String>,
    },
    /// Print one page of record observations as JSON.
    Observations {
        #[command(flatten)]
        snapshot: SnapshotArgs,
        #[arg(long = "filter", short = 'f')]
        filters: Vec<String>,
        /// Zero-based page number.
        #[arg(long, default_value_t = 0)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        size: usize,
    },
    /// Print occurrence value counts of one rule as JSON.
    Occurrences {
        #[command(flatten)]
        snapshot: SnapshotArgs,
        #[arg(long)]
        rule: RuleId,
        #[arg(long = "filter", short = 'f')]
        filters: Vec<String>,
    },
    /// Convert a flat observation file into fact files.
    MigrateLegacy {
        #[command(flatten)]
        snapshot: SnapshotArgs,
    },
    /// Convert columnar catalog batches into catalog.db.
    MigrateCatalog {
        #[command(flatten)]
        snapshot: SnapshotArgs,
        /// Count the records without writing anything.
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
    /// Remove everything stored for a snapshot.
    Delete {
        #[command(flatten)]
        snapshot: SnapshotArgs,
    },
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.store)?;
    let service = ValidationStatsService::new(config)?;

    match cli.command {
        Command::Stats { snapshot, filters } => {
            let metadata = load_metadata(&service, &snapshot)?;
            print_json(&service.query_validator_rules_stats_by_snapshot(&metadata, &filters)?)
        }
        Command::Observations {
            snapshot,
            filters,
            page,
            size,
        } => {
            let metadata = load_metadata(&service, &snapshot)?;
            print_json(
                &service
                    .query_validation_stats_observations_by_snapshot_id(&metadata, &filters, page, size)?,
            )
        }
        Command::Occurrences {
            snapshot,
            rule,
            filters,
        } => {
            let metadata = load_metadata(&service, &snapshot)?;
            print_json(
                &service.query_valid_rule_occurrences_count_by_snapshot_id(&metadata, rule, &filters)?,
            )
        }
        Command::MigrateLegacy { snapshot } => {
            let metadata = load_metadata(&service, &snapshot)?;
            let stats = service.migrate_legacy(&metadata)?;
            println!(
                "Migrated {} records ({} fact rows, {} files) into {}",
                stats.records,
                stats.rows,
                stats.files,
                metadata.key()
            );
            Ok(())
        }
        Command::MigrateCatalog { snapshot, dry_run } => {
            let key = harvest::SnapshotKey::new(&snapshot.network, snapshot.snapshot);
            let config = service.config();
            let report = migrate_legacy_catalog(&config.base_path, &key, &config.catalog, dry_run)?;
            println!("{}", report.message);
            println!(
                "  batches {:>6} | migrated {:>10} | skipped {:>8}",
                report.batches_processed, report.records_migrated, report.records_skipped
            );
            if report.success {
                Ok(())
            } else {
                Err(Error::InvalidArgumentError(report.message))
            }
        }
        Command::Delete { snapshot } => {
            let metadata = load_metadata(&service, &snapshot)?;
            service.delete_validation_stats_by_snapshot_id(&metadata)?;
            println!("Deleted {}", metadata.key());
            Ok(())
        }
    }
}

fn load_config(args: &StoreArgs) -> Result<StoreConfig> {
    let config = match (&args.config, &args.base_path) {
        (Some(path), _) => StoreConfig::from_json_file(path)?,
        (None, Some(base)) => StoreConfig::new(base),
        (None, None) => {
            return Err(Error::InvalidArgumentError(
                "either --config or --base-path is required".into(),
            ))
        }
    };
    Ok(match &args.legacy_stats_path {
        Some(path) => config.with_legacy_stats_path(path),
        None => config,
    })
}

/// Saved snapshot metadata, or a bare description for snapshots that never
/// had one written (flat legacy files).
fn load_metadata(service: &ValidationStatsService, args: &SnapshotArgs) -> Result<SnapshotMetadata> {
    match SnapshotMetadata::load(&service.config().base_path, &args.network, args.snapshot.into()) {
        Ok(metadata) => Ok(metadata),
        Err(e) if e.is_not_found() => {
            tracing::warn!(
                "no metadata.json for {} snapshot {}; rule labels unavailable",
                args.network,
                args.snapshot
            );
            Ok(SnapshotMetadata::new(args.snapshot, args.network.as_str()))
        }
        Err(e) => Err(e),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
