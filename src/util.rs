use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::{FileConfig, MaskError, Result};

pub(crate) const DEFAULT_WORKSPACE_DIR: &str = ".";
pub(crate) const DEFAULT_DB_FILE: &str = "mask.db";

pub(crate) fn env_optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

pub(crate) fn env_u16(name: &str, default: u16) -> Result<u16> {
    match env_optional(name) {
        Some(value) => value
            .trim()
            .parse::<u16>()
            .map_err(|_| MaskError::InvalidInput(format!("Invalid {name}: {value}"))),
        None => Ok(default),
    }
}

pub(crate) fn resolve_workspace(cli: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli {
        return path;
    }
    if let Some(value) = env_optional("MASKBOARD_WORKSPACE") {
        return PathBuf::from(value);
    }
    PathBuf::from(DEFAULT_WORKSPACE_DIR)
}

/// `--db` > `MASKBOARD_DB` > `db_path` in config.json (relative to the workspace) > `mask.db`.
pub(crate) fn resolve_db_path(cli: Option<PathBuf>, workspace: &Path, config: &FileConfig) -> PathBuf {
    if let Some(path) = cli {
        return path;
    }
    if let Some(value) = env_optional("MASKBOARD_DB") {
        return PathBuf::from(value);
    }
    if let Some(path) = &config.db_path {
        if path.is_absolute() {
            return path.clone();
        }
        return workspace.join(path);
    }
    workspace.join(DEFAULT_DB_FILE)
}

/// Accepts `YYYY-MM-DD` and the `YYYY/MM/DD` form spreadsheets tend to produce.
pub(crate) fn parse_date(value: &str) -> Option<NaiveDate> {
    let value = value.trim();
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y/%m/%d"))
        .ok()
}

/// Fraction → `"80.0%"`, undefined → `"-"`.
pub(crate) fn format_percent(rate: Option<f64>) -> String {
    match rate {
        Some(r) => format!("{:.1}%", r * 100.0),
        None => "-".to_string(),
    }
}

pub(crate) fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Read a file, or stdin when no path is given.
pub(crate) fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => Ok(fs::read_to_string(path)?),
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}
