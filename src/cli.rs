use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

use crate::{parse_date, StoreKind};

#[derive(Parser)]
#[command(name = "maskboard")]
#[command(about = "Mask compliance tracking for parlour stores", long_about = None)]
#[command(version)]
pub(crate) struct Cli {
    /// SQLite database. Default: $MASKBOARD_DB, config.json db_path, then <workspace>/mask.db
    #[arg(long, global = true)]
    pub(crate) db: Option<PathBuf>,
    /// Directory holding config.json. Default: $MASKBOARD_WORKSPACE or the current directory
    #[arg(long, global = true)]
    pub(crate) workspace: Option<PathBuf>,
    /// Log filter (error, warn, info, debug, trace or a tracing directive)
    #[arg(long, global = true, default_value = "warn")]
    pub(crate) log_level: String,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Create the database and a default config.json.
    Init {
        /// Overwrite an existing config.json with defaults.
        #[arg(long)]
        force_config: bool,
    },

    /// Manage the store registry.
    Store {
        #[command(subcommand)]
        action: StoreAction,
    },

    /// Manage daily compliance records.
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },

    /// Paste in an attendance report and resolve the latest unresolved record per store.
    Ingest {
        /// Read the report from a file instead of stdin
        #[arg(long)]
        file: Option<PathBuf>,
        /// Parse only; print extracted blocks without touching the database
        #[arg(long)]
        dry_run: bool,
        /// With --dry-run, print every line's scan event
        #[arg(long, requires = "dry_run")]
        trace: bool,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Monthly free-text comments.
    Comment {
        #[command(subcommand)]
        action: CommentAction,
    },

    /// Compliance trend tables.
    Trend {
        #[command(subcommand)]
        action: TrendAction,
    },

    /// Persisted display settings.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show the effective report heading aliases.
    Aliases {
        #[arg(long)]
        json: bool,
    },

    /// List recent report submissions.
    Runs {
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },

    /// Serve the dashboard over HTTP.
    Serve {
        /// Bind address. Default: config.json server.bind
        #[arg(long)]
        bind: Option<String>,
        /// Port. Default: $MASKBOARD_PORT or config.json server.port
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
pub(crate) enum StoreAction {
    /// Register a store.
    Add {
        name: String,
        #[arg(long)]
        area: String,
        /// own | competitor (自店 | 競合)
        #[arg(long, default_value = "own")]
        kind: StoreKind,
    },
    /// List registered stores.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Delete a store and all of its records.
    Delete { id: i64 },
    /// Bulk-register stores from a CSV with store_name, area, type columns.
    Import { path: PathBuf },
}

#[derive(Subcommand)]
pub(crate) enum RecordAction {
    /// Enter no-mask counts for a store and day. Replaces that day's record.
    Add {
        store: String,
        /// YYYY-MM-DD. Default: today
        #[arg(long, value_parser = parse_date_arg)]
        date: Option<NaiveDate>,
        #[arg(long)]
        pachinko_no_mask: u32,
        #[arg(long)]
        slot_no_mask: u32,
        /// Pachinko attendance, if already known
        #[arg(long)]
        pachinko_active: Option<u32>,
        /// Slot attendance, if already known
        #[arg(long)]
        slot_active: Option<u32>,
    },
    /// Correct individual fields of a record; rates are recomputed.
    Edit {
        id: i64,
        #[arg(long)]
        pachinko_no_mask: Option<u32>,
        #[arg(long)]
        slot_no_mask: Option<u32>,
        #[arg(long)]
        pachinko_active: Option<u32>,
        #[arg(long)]
        slot_active: Option<u32>,
    },
    /// Delete a record.
    Delete { id: i64 },
    /// List records, newest first.
    List {
        #[arg(long)]
        store: Option<String>,
        #[arg(long)]
        area: Option<String>,
        #[arg(long)]
        kind: Option<StoreKind>,
        /// Only records still waiting for attendance
        #[arg(long)]
        unresolved: bool,
        #[arg(short = 'n', long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
    /// Bulk-load records from a CSV export.
    Import { path: PathBuf },
}

#[derive(Subcommand)]
pub(crate) enum CommentAction {
    /// Add a comment stamped with the current month.
    Add { text: String },
    /// Replace the text of a comment.
    Edit { id: i64, text: String },
    /// List comments, newest first.
    List {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum TrendAction {
    /// Per-day rates for one store.
    Store {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// Per-day rates summed over an area.
    Area {
        area: String,
        /// Restrict to own or competitor stores
        #[arg(long)]
        kind: Option<StoreKind>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Show or change the chart Y-axis range (percent).
    Chart {
        #[arg(long)]
        y_min: Option<f64>,
        #[arg(long)]
        y_max: Option<f64>,
    },
    /// Print the effective config.json settings.
    Show,
}

fn parse_date_arg(value: &str) -> Result<NaiveDate, String> {
    parse_date(value).ok_or_else(|| format!("invalid date: {value} (expected YYYY-MM-DD)"))
}
