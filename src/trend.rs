use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::NaiveDate;
use serde::Serialize;

use crate::{
    compliance_rate, format_percent, CategoryCounts, ChartRange, ComplianceRates,
    ComplianceRecord, MaskDb, MaskError, RecordFilter, Result, StoreKind, StoreRegistry,
};

/// Headcounts summed over one or more records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub(crate) struct CountTotals {
    pub(crate) pachinko: u64,
    pub(crate) slot: u64,
}

impl CountTotals {
    fn add(&mut self, counts: CategoryCounts) {
        self.pachinko = self.pachinko.saturating_add(u64::from(counts.pachinko));
        self.slot = self.slot.saturating_add(u64::from(counts.slot));
    }

    fn total(&self) -> u64 {
        self.pachinko.saturating_add(self.slot)
    }
}

impl From<CategoryCounts> for CountTotals {
    fn from(counts: CategoryCounts) -> Self {
        let mut totals = Self::default();
        totals.add(counts);
        totals
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct TrendPoint {
    pub(crate) date: NaiveDate,
    /// Records folded into this point.
    pub(crate) stores: usize,
    pub(crate) no_mask: CountTotals,
    pub(crate) active: Option<CountTotals>,
    pub(crate) rates: ComplianceRates,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct TrendResponse {
    pub(crate) label: String,
    pub(crate) range: ChartRange,
    pub(crate) points: Vec<TrendPoint>,
}

/// One point per record, oldest first. Unresolved days are kept with empty rates.
pub(crate) fn store_trend(db: &MaskDb, store: &str) -> Result<Vec<TrendPoint>> {
    if db.find_store_by_name(store)?.is_none() {
        return Err(MaskError::StoreNotFound(store.to_string()));
    }
    let records = db.query_records(&RecordFilter {
        store: Some(store.to_string()),
        ascending: true,
        ..RecordFilter::default()
    })?;
    Ok(records
        .into_iter()
        .map(|r| TrendPoint {
            date: r.date,
            stores: 1,
            no_mask: r.no_mask.into(),
            active: r.active.map(CountTotals::from),
            rates: r.rates,
        })
        .collect())
}

pub(crate) fn area_trend(db: &MaskDb, area: &str, kind: Option<StoreKind>) -> Result<Vec<TrendPoint>> {
    let records = db.query_records(&RecordFilter {
        area: Some(area.to_string()),
        kind,
        ascending: true,
        ..RecordFilter::default()
    })?;
    Ok(aggregate_by_date(&records))
}

/// Sum counts per date over resolved records. Rates are derived from the
/// sums, never averaged across stores.
pub(crate) fn aggregate_by_date(records: &[ComplianceRecord]) -> Vec<TrendPoint> {
    let mut by_date: BTreeMap<NaiveDate, (usize, CountTotals, CountTotals)> = BTreeMap::new();
    for record in records {
        if !record.is_resolved() {
            continue;
        }
        let Some(active) = record.active else {
            continue;
        };
        let entry = by_date.entry(record.date).or_default();
        entry.0 += 1;
        entry.1.add(record.no_mask);
        entry.2.add(active);
    }
    by_date
        .into_iter()
        .map(|(date, (stores, no_mask, active))| TrendPoint {
            date,
            stores,
            no_mask,
            active: Some(active),
            rates: ComplianceRates {
                pachinko: compliance_rate(active.pachinko, no_mask.pachinko),
                slot: compliance_rate(active.slot, no_mask.slot),
                total: compliance_rate(active.total(), no_mask.total()),
            },
        })
        .collect()
}

pub(crate) fn render_table(title: &str, points: &[TrendPoint], range: ChartRange) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{title}  (chart range {:.0}%–{:.0}%)", range.y_min, range.y_max);
    let _ = writeln!(
        out,
        "{:<10}  {:>6}  {:>9}  {:>9}  {:>8}  {:>8}  {:>8}",
        "date", "stores", "no-mask", "active", "rate P", "rate S", "total"
    );
    for p in points {
        let active = p
            .active
            .map(|a| format!("{}/{}", a.pachinko, a.slot))
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "{:<10}  {:>6}  {:>9}  {:>9}  {:>8}  {:>8}  {:>8}",
            p.date.format("%Y-%m-%d").to_string(),
            p.stores,
            format!("{}/{}", p.no_mask.pachinko, p.no_mask.slot),
            active,
            format_percent(p.rates.pachinko),
            format_percent(p.rates.slot),
            format_percent(p.rates.total),
        );
    }
    if points.is_empty() {
        out.push_str("(no data)\n");
    }
    out
}
