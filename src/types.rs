use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::MaskError;

pub(crate) type StoreId = i64;
pub(crate) type RecordId = i64;

// ── StoreKind ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub(crate) enum StoreKind {
    #[default]
    Own,
    Competitor,
}

impl StoreKind {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Own => "own",
            Self::Competitor => "competitor",
        }
    }

    /// Accepts the stored form as well as the labels used on the store sheet.
    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "own" | "自店" => Some(Self::Own),
            "competitor" | "競合" => Some(Self::Competitor),
            _ => None,
        }
    }

    pub(crate) fn from_db_str(s: &str) -> Self {
        Self::parse(s).unwrap_or_default()
    }
}

impl std::fmt::Display for StoreKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StoreKind {
    type Err = MaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| MaskError::InvalidInput(format!("unknown store kind: {s}")))
    }
}

// ── Store ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Store {
    pub(crate) id: StoreId,
    pub(crate) name: String,
    pub(crate) area: String,
    pub(crate) kind: StoreKind,
}

#[derive(Debug, Clone)]
pub(crate) struct NewStore {
    pub(crate) name: String,
    pub(crate) area: String,
    pub(crate) kind: StoreKind,
}

// ── Counts & rates ───────────────────────────────────────────────────────

/// Per-category headcounts. Category A is pachinko, category B is slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub(crate) struct CategoryCounts {
    pub(crate) pachinko: u32,
    pub(crate) slot: u32,
}

impl CategoryCounts {
    pub(crate) fn new(pachinko: u32, slot: u32) -> Self {
        Self { pachinko, slot }
    }

    /// Widened so two full-range counts never overflow.
    pub(crate) fn total(&self) -> u64 {
        u64::from(self.pachinko) + u64::from(self.slot)
    }
}

/// Compliance rates as fractions. `None` when the attendance denominator is zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub(crate) struct ComplianceRates {
    pub(crate) pachinko: Option<f64>,
    pub(crate) slot: Option<f64>,
    pub(crate) total: Option<f64>,
}

// ── ComplianceRecord ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct ComplianceRecord {
    pub(crate) id: RecordId,
    pub(crate) store_id: StoreId,
    pub(crate) store_name: String,
    pub(crate) date: NaiveDate,
    pub(crate) no_mask: CategoryCounts,
    /// `None` until attendance has been filled in.
    pub(crate) active: Option<CategoryCounts>,
    pub(crate) rates: ComplianceRates,
}

impl ComplianceRecord {
    pub(crate) fn is_resolved(&self) -> bool {
        self.active.is_some_and(|a| a.pachinko > 0)
    }
}

/// Manual entry for one (store, date) pair.
#[derive(Debug, Clone)]
pub(crate) struct RecordEntry {
    pub(crate) store: String,
    pub(crate) date: NaiveDate,
    pub(crate) no_mask: CategoryCounts,
    pub(crate) active: Option<CategoryCounts>,
}

/// Field overrides for a manual correction. Unset fields keep their value.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordEdit {
    pub(crate) pachinko_no_mask: Option<u32>,
    pub(crate) slot_no_mask: Option<u32>,
    pub(crate) pachinko_active: Option<u32>,
    pub(crate) slot_active: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpsertOutcome {
    Inserted(RecordId),
    Updated(RecordId),
}

// ── Comment ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Comment {
    pub(crate) id: i64,
    pub(crate) year: i32,
    pub(crate) month: u32,
    pub(crate) comment: String,
    pub(crate) created_at: String,
}

// ── ChartRange ───────────────────────────────────────────────────────────

/// Y-axis display range for compliance charts, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct ChartRange {
    pub(crate) y_min: f64,
    pub(crate) y_max: f64,
}

impl Default for ChartRange {
    fn default() -> Self {
        Self {
            y_min: 0.0,
            y_max: 100.0,
        }
    }
}

impl ChartRange {
    pub(crate) fn validate(&self) -> Result<(), MaskError> {
        if !(0.0..=100.0).contains(&self.y_min) || !(0.0..=100.0).contains(&self.y_max) {
            return Err(MaskError::InvalidInput(format!(
                "chart range must lie within 0..=100 (got {}..{})",
                self.y_min, self.y_max
            )));
        }
        if self.y_min >= self.y_max {
            return Err(MaskError::InvalidInput(format!(
                "y_min ({}) must be below y_max ({})",
                self.y_min, self.y_max
            )));
        }
        Ok(())
    }
}

// ── Ingest run summaries ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub(crate) struct IngestRun {
    pub(crate) id: i64,
    pub(crate) digest: String,
    pub(crate) submitted_at: i64,
    pub(crate) updated: usize,
    pub(crate) missing: usize,
}
