// Module declarations
mod cli;
mod config_file;
mod error;
mod import;
mod memory_db;
mod recorder;
mod repo;
mod report;
mod services;
mod trend;
mod types;
mod util;

// Every module's items live at the crate root so modules can refer to each
// other through `crate::Name`.
#[allow(unused_imports)]
pub(crate) use cli::*;
#[allow(unused_imports)]
pub(crate) use config_file::*;
#[allow(unused_imports)]
pub(crate) use error::*;
#[allow(unused_imports)]
pub(crate) use import::*;
#[allow(unused_imports)]
pub(crate) use memory_db::*;
#[allow(unused_imports)]
pub(crate) use recorder::*;
#[allow(unused_imports)]
pub(crate) use repo::*;
#[allow(unused_imports)]
pub(crate) use report::*;
#[allow(unused_imports)]
pub(crate) use services::*;
#[allow(unused_imports)]
pub(crate) use trend::*;
#[allow(unused_imports)]
pub(crate) use types::*;
#[allow(unused_imports)]
pub(crate) use util::*;

use std::fs;
use std::path::Path;

use chrono::{DateTime, Local};
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let workspace = resolve_workspace(cli.workspace);
    let config_path = config_file_path(&workspace);
    let config = load_file_config(&config_path);
    let db_path = resolve_db_path(cli.db, &workspace, &config);

    match cli.command {
        Command::Init { force_config } => {
            if force_config || !config_path.exists() {
                save_file_config(&config_path, &FileConfig::default())?;
                println!("Wrote {}", config_path.display());
            }
            let existed = db_path.exists();
            let _ = MaskDb::open_or_create(&db_path)?;
            if existed {
                println!("Database already present: {}", db_path.display());
            } else {
                println!("Created {}", db_path.display());
            }
            Ok(())
        }

        Command::Store { action } => {
            let db = MaskDb::open(&db_path)?;
            run_store(&db, action)
        }

        Command::Record { action } => {
            let db = MaskDb::open(&db_path)?;
            run_record(&db, action)
        }

        Command::Ingest {
            file,
            dry_run,
            trace,
            json,
        } => {
            let text = read_input(file.as_deref())?;
            let aliases = config.alias_table();
            let format = config.report_format();

            if dry_run {
                if text.trim().is_empty() {
                    return Err(MaskError::EmptyReport.into());
                }
                if trace {
                    let traced = scan_events(&text, &aliases, &format);
                    for (lineno, (event, store)) in traced.iter().enumerate() {
                        if *event != LineEvent::Noop {
                            let store = store.as_deref().unwrap_or("-");
                            println!("{:>5}  [{store}]  {event:?}", lineno + 1);
                        }
                    }
                }
                let blocks: Vec<Extraction> = extractions(&text, &aliases, &format).collect();
                if json {
                    println!("{}", serde_json::to_string_pretty(&blocks)?);
                } else if blocks.is_empty() {
                    println!("No store blocks found.");
                } else {
                    for block in &blocks {
                        println!("{}\tP {}\tS {}", block.store, block.pachinko, block.slot);
                    }
                }
                return Ok(());
            }

            let db = MaskDb::open(&db_path)?;
            let report = db.ingest_report(&text, &aliases, &format)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            if let Some(prev) = &report.previous_run {
                println!(
                    "Note: identical report already submitted (run {} at {}).",
                    prev.id,
                    format_timestamp(prev.submitted_at)
                );
            }
            if report.outcomes.is_empty() {
                println!("No store blocks found.");
            }
            for outcome in &report.outcomes {
                println!("{outcome}");
            }
            println!(
                "run {}: {} updated, {} without an unresolved record",
                report.run_id,
                report.updated_count(),
                report.missing_count()
            );
            Ok(())
        }

        Command::Comment { action } => {
            let db = MaskDb::open(&db_path)?;
            match action {
                CommentAction::Add { text } => {
                    let id = db.add_comment(&text, Local::now().naive_local())?;
                    println!("Added comment {id}");
                }
                CommentAction::Edit { id, text } => {
                    db.edit_comment(id, &text)?;
                    println!("Updated comment {id}");
                }
                CommentAction::List { json } => {
                    let comments = db.list_comments()?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&comments)?);
                    } else if comments.is_empty() {
                        println!("No comments.");
                    } else {
                        for c in &comments {
                            println!("[{}] {}年{}月  {}", c.id, c.year, c.month, c.comment);
                        }
                    }
                }
            }
            Ok(())
        }

        Command::Trend { action } => {
            let db = MaskDb::open(&db_path)?;
            let range = db.chart_range()?;
            let (label, points, json) = match action {
                TrendAction::Store { name, json } => {
                    let points = store_trend(&db, &name)?;
                    (name, points, json)
                }
                TrendAction::Area { area, kind, json } => {
                    let points = area_trend(&db, &area, kind)?;
                    let label = match kind {
                        Some(kind) => format!("{area} ({kind})"),
                        None => area,
                    };
                    (label, points, json)
                }
            };
            if json {
                let response = TrendResponse { label, range, points };
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print!("{}", render_table(&label, &points, range));
            }
            Ok(())
        }

        Command::Config { action } => match action {
            ConfigAction::Chart { y_min, y_max } => {
                let db = MaskDb::open(&db_path)?;
                let current = db.chart_range()?;
                if y_min.is_none() && y_max.is_none() {
                    println!("y_min = {}\ny_max = {}", current.y_min, current.y_max);
                    return Ok(());
                }
                let range = ChartRange {
                    y_min: y_min.unwrap_or(current.y_min),
                    y_max: y_max.unwrap_or(current.y_max),
                };
                db.set_chart_range(range)?;
                println!("Chart range set to {}..{}", range.y_min, range.y_max);
                Ok(())
            }
            ConfigAction::Show => {
                println!("# {}", config_path.display());
                println!("{}", serde_json::to_string_pretty(&config)?);
                println!("# database: {}", db_path.display());
                Ok(())
            }
        },

        Command::Aliases { json } => {
            let aliases = config.alias_table();
            if json {
                let map: std::collections::BTreeMap<&str, &str> =
                    aliases.entries().into_iter().collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (label, store) in aliases.entries() {
                    println!("{label}\t→ {store}");
                }
                println!("{} aliases", aliases.len());
            }
            Ok(())
        }

        Command::Runs { limit, json } => {
            let db = MaskDb::open(&db_path)?;
            let runs = db.recent_ingest_runs(limit)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("No reports submitted yet.");
            } else {
                for run in &runs {
                    println!(
                        "{:>4}  {}  updated {:>2}  missing {:>2}  {}",
                        run.id,
                        format_timestamp(run.submitted_at),
                        run.updated,
                        run.missing,
                        &run.digest[..run.digest.len().min(12)]
                    );
                }
            }
            Ok(())
        }

        Command::Serve { bind, port } => {
            let db = MaskDb::open(&db_path)?;
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            let port = match port {
                Some(port) => port,
                None => env_u16("MASKBOARD_PORT", config.server.port)?,
            };
            info!(db = %db_path.display(), "starting dashboard");
            let dashboard = Dashboard::new(db, config.alias_table(), config.report_format());
            run_dashboard(dashboard, &bind, port)?;
            Ok(())
        }
    }
}

fn run_store(db: &MaskDb, action: StoreAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        StoreAction::Add { name, area, kind } => {
            let id = db.add_store(&NewStore { name: name.clone(), area, kind })?;
            println!("Registered store {id}: {name}");
        }
        StoreAction::List { json } => {
            let stores = db.list_stores()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stores)?);
            } else if stores.is_empty() {
                println!("No stores registered.");
            } else {
                for s in &stores {
                    println!("{:>4}  {:<12}  {:<10}  {}", s.id, s.area, s.kind, s.name);
                }
            }
        }
        StoreAction::Delete { id } => {
            let store = db.delete_store(id)?;
            println!("Deleted store {id}: {}", store.name);
        }
        StoreAction::Import { path } => {
            let stores = parse_store_csv(&read_csv(&path)?)?;
            let count = db.import_stores(&stores)?;
            println!("Imported {count} stores from {}", path.display());
        }
    }
    Ok(())
}

fn run_record(db: &MaskDb, action: RecordAction) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        RecordAction::Add {
            store,
            date,
            pachinko_no_mask,
            slot_no_mask,
            pachinko_active,
            slot_active,
        } => {
            let active = if pachinko_active.is_some() || slot_active.is_some() {
                Some(CategoryCounts::new(
                    pachinko_active.unwrap_or(0),
                    slot_active.unwrap_or(0),
                ))
            } else {
                None
            };
            let entry = RecordEntry {
                store,
                date: date.unwrap_or_else(|| Local::now().date_naive()),
                no_mask: CategoryCounts::new(pachinko_no_mask, slot_no_mask),
                active,
            };
            match db.upsert_record(&entry)? {
                UpsertOutcome::Inserted(id) => {
                    println!("Added record {id}: {} {}", entry.store, entry.date)
                }
                UpsertOutcome::Updated(id) => {
                    println!("Replaced record {id}: {} {}", entry.store, entry.date)
                }
            }
        }
        RecordAction::Edit {
            id,
            pachinko_no_mask,
            slot_no_mask,
            pachinko_active,
            slot_active,
        } => {
            let edit = RecordEdit {
                pachinko_no_mask,
                slot_no_mask,
                pachinko_active,
                slot_active,
            };
            let record = db.edit_record(id, &edit)?;
            println!("Updated record {id}");
            print_records(std::slice::from_ref(&record));
        }
        RecordAction::Delete { id } => {
            db.delete_record(id)?;
            println!("Deleted record {id}");
        }
        RecordAction::List {
            store,
            area,
            kind,
            unresolved,
            limit,
            json,
        } => {
            let filter = RecordFilter {
                store,
                area,
                kind,
                unresolved_only: unresolved,
                ascending: false,
            };
            let mut records = db.query_records(&filter)?;
            records.truncate(limit);
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No records.");
            } else {
                print_records(&records);
            }
        }
        RecordAction::Import { path } => {
            let rows = parse_record_csv(&read_csv(&path)?)?;
            let count = db.import_records(&rows)?;
            println!("Imported {count} records from {}", path.display());
        }
    }
    Ok(())
}

fn print_records(records: &[ComplianceRecord]) {
    println!(
        "{:>5}  {:<10}  {:<16}  {:>7}  {:>9}  {:>7}  {:>7}  {:>7}",
        "id", "date", "store", "no-mask", "active", "rate P", "rate S", "total"
    );
    for r in records {
        let active = r
            .active
            .map(|a| format!("{}/{}", a.pachinko, a.slot))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>5}  {:<10}  {:<16}  {:>7}  {:>9}  {:>7}  {:>7}  {:>7}",
            r.id,
            r.date.format("%Y-%m-%d").to_string(),
            r.store_name,
            format!("{}/{}", r.no_mask.pachinko, r.no_mask.slot),
            active,
            format_percent(r.rates.pachinko),
            format_percent(r.rates.slot),
            format_percent(r.rates.total),
        );
    }
}

fn read_csv(path: &Path) -> Result<String, Box<dyn std::error::Error>> {
    let bytes = fs::read(path)?;
    String::from_utf8(bytes)
        .map_err(|_| format!("{} is not UTF-8 text", path.display()).into())
}

fn format_timestamp(secs: i64) -> String {
    DateTime::from_timestamp(secs, 0)
        .map(|dt| {
            dt.with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
                .to_string()
        })
        .unwrap_or_else(|| secs.to_string())
}
