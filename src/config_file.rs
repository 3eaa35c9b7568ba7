use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{AliasTable, ReportFormat, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub(crate) struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) db_path: Option<PathBuf>,
    #[serde(default)]
    pub(crate) report: ReportConfig,
    /// Extra or replacement report headings → canonical store names.
    #[serde(default)]
    pub(crate) aliases: BTreeMap<String, String>,
    #[serde(default)]
    pub(crate) server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ReportConfig {
    pub(crate) marker_a: String,
    pub(crate) marker_b: String,
    pub(crate) value_token: usize,
    pub(crate) reset_after_emit: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        let format = ReportFormat::default();
        Self {
            marker_a: format.marker_a,
            marker_b: format.marker_b,
            value_token: format.value_token,
            reset_after_emit: format.reset_after_emit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct ServerConfig {
    pub(crate) bind: String,
    pub(crate) port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8501,
        }
    }
}

impl FileConfig {
    pub(crate) fn alias_table(&self) -> AliasTable {
        AliasTable::with_overrides(&self.aliases)
    }

    pub(crate) fn report_format(&self) -> ReportFormat {
        ReportFormat {
            marker_a: self.report.marker_a.clone(),
            marker_b: self.report.marker_b.clone(),
            value_token: self.report.value_token,
            reset_after_emit: self.report.reset_after_emit,
        }
    }
}

pub(crate) fn config_file_path(workspace: &Path) -> PathBuf {
    workspace.join("config.json")
}

/// Missing file → defaults. A file that fails to parse also yields defaults,
/// with a warning.
pub(crate) fn load_file_config(path: &Path) -> FileConfig {
    match std::fs::read_to_string(path) {
        Ok(data) => serde_json::from_str(&data).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "ignoring unreadable config file");
            FileConfig::default()
        }),
        Err(_) => FileConfig::default(),
    }
}

pub(crate) fn save_file_config(path: &Path, config: &FileConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
