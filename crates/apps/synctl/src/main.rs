//! Synctl - Job trigger for ERP-to-portal synchronization
//!
//! Thin CLI over the erpsync engine: pick a stream, pick a mode, run once,
//! print the report. Scheduling stays outside (cron or the ops runner).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info};

use erpsync::{
    ErpClient, ErpCredentials, RecordId, SqliteSyncStore, StreamDescriptor, SyncEngine, SyncMode,
    SyncOptions, SyncReport, SyncStore, UreqTransport, WebhookNotifier, fulfillments, invoices,
    sales_orders,
};

#[derive(Parser)]
#[command(name = "synctl")]
#[command(about = "Synchronize ERP records into the portal datastore")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the portal database (defaults to the config directory)
    #[arg(long, value_name = "PATH", global = true)]
    db_path: Option<PathBuf>,

    /// Webhook URL for first-seen open-balance notifications
    #[arg(long, value_name = "URL", global = true)]
    webhook: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the incremental sync for one stream
    Run {
        stream: Stream,

        /// Discover and diff, but write nothing
        #[arg(long)]
        dry_run: bool,

        /// Ignore the stored cursor and rescan the full lookback window
        #[arg(long)]
        full: bool,

        /// Rescan start date (YYYY-MM-DD, implies --full)
        #[arg(long, value_name = "DATE")]
        since: Option<NaiveDate>,

        /// Sync only these upstream IDs (comma-separated)
        #[arg(long, value_name = "IDS", value_delimiter = ',')]
        ids: Vec<String>,

        /// Customer-ID scope (comma-separated); empty = unscoped
        #[arg(long, value_name = "CUSTOMERS", value_delimiter = ',')]
        scope: Vec<String>,
    },
    /// Rebuild a stream from a pre-staged bulk export
    Snapshot {
        stream: Stream,

        /// ERP folder holding the export manifest and data files
        #[arg(long, value_name = "FOLDER")]
        folder: String,

        /// Discover and diff, but write nothing
        #[arg(long)]
        dry_run: bool,
    },
    /// Print each stream's cursor position
    Status,
}

#[derive(Clone, Copy, ValueEnum)]
enum Stream {
    Invoices,
    Fulfillments,
    SalesOrders,
}

impl Stream {
    fn descriptor(self) -> StreamDescriptor {
        match self {
            Self::Invoices => invoices(),
            Self::Fulfillments => fulfillments(),
            Self::SalesOrders => sales_orders(),
        }
    }

    fn all() -> [StreamDescriptor; 3] {
        [invoices(), fulfillments(), sales_orders()]
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let store = open_store(cli.db_path.as_deref())?;

    match cli.command {
        Commands::Status => {
            for descriptor in Stream::all() {
                match store.get_cursor(descriptor.kind.key())? {
                    Some(cursor) => info!(
                        "{}: cursor at {}, last success {}",
                        descriptor.kind, cursor.last_cursor, cursor.last_success_at
                    ),
                    None => info!("{}: never synced", descriptor.kind),
                }
            }
            Ok(())
        }
        Commands::Run {
            stream,
            dry_run,
            full,
            since,
            ids,
            scope,
        } => {
            let mode = if !ids.is_empty() {
                SyncMode::Explicit {
                    ids: ids.into_iter().map(RecordId::new).collect(),
                }
            } else if full || since.is_some() {
                SyncMode::FullRescan {
                    since: since.map(start_of_day),
                }
            } else {
                SyncMode::Incremental
            };

            let options = SyncOptions {
                mode,
                dry_run,
                scope,
                ..SyncOptions::default()
            };
            let engine = build_engine(store, cli.webhook)?;
            let report = engine.run(&stream.descriptor(), &options)?;
            print_report(&report);
            Ok(())
        }
        Commands::Snapshot {
            stream,
            folder,
            dry_run,
        } => {
            let options = SyncOptions {
                dry_run,
                ..SyncOptions::default()
            };
            let engine = build_engine(store, cli.webhook)?;
            let report = engine.run_snapshot(&stream.descriptor(), &folder, &options)?;
            print_report(&report);
            Ok(())
        }
    }
}

fn open_store(db_path: Option<&std::path::Path>) -> Result<Arc<SqliteSyncStore>> {
    let path = match db_path {
        Some(path) => path.to_path_buf(),
        None => config::ensure_config_dir()
            .context("Failed to resolve config directory")?
            .join("portal.db"),
    };
    info!("Opening portal datastore at {}", path.display());
    Ok(Arc::new(SqliteSyncStore::new(&path)?))
}

fn build_engine(store: Arc<SqliteSyncStore>, webhook: Option<String>) -> Result<SyncEngine> {
    let credentials = ErpCredentials::load().context(
        "ERP credentials not found; place erp-credentials.json in the config \
         directory or set ERP_BASE_URL and ERP_TOKEN",
    )?;
    let client = ErpClient::new(Arc::new(UreqTransport::new(&credentials)));

    Ok(match webhook {
        Some(url) => SyncEngine::with_notifier(client, store, Box::new(WebhookNotifier::new(url))),
        None => SyncEngine::new(client, store),
    })
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
}

fn print_report(report: &SyncReport) {
    info!(
        "{}{}: {} discovered, {} new, {} changed, {} unchanged, {} tombstoned \
         ({} exempted), {} notifications, {}ms",
        report.stream_key,
        if report.dry_run { " [dry run]" } else { "" },
        report.discovered,
        report.new,
        report.changed,
        report.unchanged,
        report.tombstoned,
        report.exempted,
        report.notifications,
        report.duration_ms,
    );
    if report.dry_run && report.missing > 0 {
        info!("would tombstone {} records", report.missing);
    }
}
