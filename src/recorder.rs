//! Compliance recording: turn parsed attendance into resolved records.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    extractions, AliasTable, AttendanceUpdate, CategoryCounts, ComplianceRates, Extraction,
    IngestRun, RecordId, RecordStore, ReportFormat, Result,
};

/// `(attendance - non_compliant) / attendance`, undefined for zero attendance.
///
/// Not clamped: a negative rate means more non-compliant guests were counted
/// than attended, which is worth surfacing as-is.
pub(crate) fn compliance_rate(attendance: u64, non_compliant: u64) -> Option<f64> {
    if attendance == 0 {
        return None;
    }
    let attendance = attendance as f64;
    Some((attendance - non_compliant as f64) / attendance)
}

impl ComplianceRates {
    pub(crate) fn compute(active: CategoryCounts, no_mask: CategoryCounts) -> Self {
        Self {
            pachinko: compliance_rate(u64::from(active.pachinko), u64::from(no_mask.pachinko)),
            slot: compliance_rate(u64::from(active.slot), u64::from(no_mask.slot)),
            total: compliance_rate(active.total(), no_mask.total()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub(crate) enum Outcome {
    Updated {
        store: String,
        record_id: RecordId,
        date: NaiveDate,
        active: CategoryCounts,
        rates: ComplianceRates,
    },
    NoUnresolvedRecord {
        store: String,
    },
}

impl Outcome {
    pub(crate) fn store(&self) -> &str {
        match self {
            Self::Updated { store, .. } | Self::NoUnresolvedRecord { store } => store,
        }
    }

    pub(crate) fn is_updated(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Updated { store, .. } => write!(f, "✅ {store} の最新データを更新しました。"),
            Self::NoUnresolvedRecord { store } => {
                write!(f, "⚠️ {store} に該当する未登録データが見つかりませんでした。")
            }
        }
    }
}

/// Result of one submitted report.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct IngestReport {
    pub(crate) run_id: i64,
    pub(crate) digest: String,
    /// Earlier run with byte-identical text, if any.
    pub(crate) previous_run: Option<IngestRun>,
    pub(crate) outcomes: Vec<Outcome>,
}

impl IngestReport {
    pub(crate) fn updated_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_updated()).count()
    }

    pub(crate) fn missing_count(&self) -> usize {
        self.outcomes.len() - self.updated_count()
    }
}

/// Apply one extraction: resolve the store's latest unresolved record, if any.
pub(crate) fn record_extraction<R: RecordStore + ?Sized>(
    records: &R,
    extraction: &Extraction,
) -> Result<Outcome> {
    let Some(target) = records.find_latest_unresolved(&extraction.store)? else {
        warn!(store = %extraction.store, "no unresolved record for report block");
        return Ok(Outcome::NoUnresolvedRecord {
            store: extraction.store.clone(),
        });
    };

    let active = extraction.counts();
    let rates = ComplianceRates::compute(active, target.no_mask);
    let update = AttendanceUpdate { active, rates };
    records.update_attendance_and_rates(target.id, &update)?;
    info!(
        store = %target.store_name,
        record_id = target.id,
        date = %target.date,
        pachinko = active.pachinko,
        slot = active.slot,
        "attendance recorded"
    );

    Ok(Outcome::Updated {
        store: extraction.store.clone(),
        record_id: target.id,
        date: target.date,
        active,
        rates,
    })
}

/// Parse `text` and apply every completed block in order.
///
/// Each block is applied as soon as it is emitted, so a later block for the
/// same store sees the effect of an earlier one. Transaction boundaries are
/// the caller's concern.
pub(crate) fn apply_report<R: RecordStore + ?Sized>(
    records: &R,
    text: &str,
    aliases: &AliasTable,
    format: &ReportFormat,
) -> Result<Vec<Outcome>> {
    let mut outcomes = Vec::new();
    for extraction in extractions(text, aliases, format) {
        debug!(store = %extraction.store, pachinko = extraction.pachinko, slot = extraction.slot, "block parsed");
        outcomes.push(record_extraction(records, &extraction)?);
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MaskError, UnresolvedRecord};
    use std::cell::RefCell;

    struct FakeRow {
        id: RecordId,
        store: String,
        date: NaiveDate,
        no_mask: CategoryCounts,
        active: Option<CategoryCounts>,
        rates: ComplianceRates,
    }

    #[derive(Default)]
    struct FakeRecords {
        rows: RefCell<Vec<FakeRow>>,
        updates: RefCell<Vec<(RecordId, AttendanceUpdate)>>,
        fail_updates: bool,
    }

    impl FakeRecords {
        fn push(&self, id: RecordId, store: &str, date: &str, p: u32, s: u32) {
            self.rows.borrow_mut().push(FakeRow {
                id,
                store: store.to_string(),
                date: date.parse().unwrap(),
                no_mask: CategoryCounts::new(p, s),
                active: None,
                rates: ComplianceRates::default(),
            });
        }
    }

    impl RecordStore for FakeRecords {
        fn find_latest_unresolved(&self, store_name: &str) -> Result<Option<UnresolvedRecord>> {
            let rows = self.rows.borrow();
            Ok(rows
                .iter()
                .filter(|r| r.store == store_name && r.active.is_none())
                .max_by_key(|r| (r.date, r.id))
                .map(|r| UnresolvedRecord {
                    id: r.id,
                    store_name: r.store.clone(),
                    date: r.date,
                    no_mask: r.no_mask,
                }))
        }

        fn update_attendance_and_rates(
            &self,
            record_id: RecordId,
            update: &AttendanceUpdate,
        ) -> Result<()> {
            if self.fail_updates {
                return Err(MaskError::Server("backing store unavailable".to_string()));
            }
            let mut rows = self.rows.borrow_mut();
            let row = rows
                .iter_mut()
                .find(|r| r.id == record_id)
                .ok_or(MaskError::RecordNotFound(record_id))?;
            row.active = Some(update.active);
            row.rates = update.rates;
            self.updates.borrow_mut().push((record_id, *update));
            Ok(())
        }
    }

    fn approx(actual: Option<f64>, expected: f64) {
        let actual = actual.expect("rate should be defined");
        assert!((actual - expected).abs() < 1e-9, "{actual} != {expected}");
    }

    #[test]
    fn rate_is_exact_fraction() {
        assert_eq!(compliance_rate(10, 2), Some(0.8));
    }

    #[test]
    fn zero_attendance_has_no_rate() {
        assert_eq!(compliance_rate(0, 0), None);
        assert_eq!(compliance_rate(0, 3), None);
    }

    #[test]
    fn rate_handles_totals_beyond_u32() {
        let active = CategoryCounts::new(u32::MAX, u32::MAX);
        let rates = ComplianceRates::compute(active, CategoryCounts::new(0, 0));
        assert_eq!(active.total(), 2 * u64::from(u32::MAX));
        assert_eq!(rates.total, Some(1.0));
        let half = compliance_rate(2 * u64::from(u32::MAX), u64::from(u32::MAX));
        approx(half, 0.5);
    }

    #[test]
    fn rate_may_go_negative() {
        assert_eq!(compliance_rate(2, 5), Some(-1.5));
    }

    #[test]
    fn rates_for_partial_zero_attendance() {
        let rates = ComplianceRates::compute(CategoryCounts::new(0, 4), CategoryCounts::new(0, 1));
        assert_eq!(rates.pachinko, None);
        approx(rates.slot, 0.75);
        approx(rates.total, 0.75);
    }

    #[test]
    fn end_to_end_update() {
        let records = FakeRecords::default();
        records.push(1, "延岡店", "2024-01-01", 1, 1);

        let text = "西の丸延岡店\nP  計   5\nS  計   3\n";
        let outcomes =
            apply_report(&records, text, &AliasTable::builtin(), &ReportFormat::default())
                .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            outcomes[0].to_string(),
            "✅ 延岡店 の最新データを更新しました。"
        );
        let updates = records.updates.borrow();
        assert_eq!(updates.len(), 1);
        let (id, update) = updates[0];
        assert_eq!(id, 1);
        assert_eq!(update.active, CategoryCounts::new(5, 3));
        assert_eq!(update.active.total(), 8);
        approx(update.rates.pachinko, 0.8);
        approx(update.rates.slot, 2.0 / 3.0);
        approx(update.rates.total, 0.75);
    }

    #[test]
    fn missing_record_reports_and_does_not_mutate() {
        let records = FakeRecords::default();
        let text = "西の丸延岡店\nP  計   5\nS  計   3\n";
        let outcomes =
            apply_report(&records, text, &AliasTable::builtin(), &ReportFormat::default())
                .unwrap();
        assert_eq!(
            outcomes,
            vec![Outcome::NoUnresolvedRecord {
                store: "延岡店".to_string()
            }]
        );
        assert!(outcomes[0].to_string().starts_with("⚠️ 延岡店"));
        assert!(records.updates.borrow().is_empty());
    }

    #[test]
    fn latest_unresolved_record_is_targeted() {
        let records = FakeRecords::default();
        records.push(1, "延岡店", "2024-01-01", 1, 1);
        records.push(2, "延岡店", "2024-01-03", 2, 0);
        records.push(3, "延岡店", "2024-01-02", 0, 0);
        let extraction = Extraction {
            store: "延岡店".to_string(),
            pachinko: 10,
            slot: 5,
        };
        let outcome = record_extraction(&records, &extraction).unwrap();
        match outcome {
            Outcome::Updated { record_id, rates, .. } => {
                assert_eq!(record_id, 2);
                assert_eq!(rates.pachinko, Some(0.8));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn resubmitting_same_report_finds_nothing() {
        let records = FakeRecords::default();
        records.push(1, "延岡店", "2024-01-01", 1, 1);
        let text = "西の丸延岡店\nP  計   5\nS  計   3\n";
        let aliases = AliasTable::builtin();
        let format = ReportFormat::default();

        let first = apply_report(&records, text, &aliases, &format).unwrap();
        assert!(first[0].is_updated());
        let second = apply_report(&records, text, &aliases, &format).unwrap();
        assert!(!second[0].is_updated());
        assert_eq!(second[0].store(), "延岡店");
        assert_eq!(records.updates.borrow().len(), 1);
    }

    #[test]
    fn persistence_failure_aborts_run() {
        let records = FakeRecords {
            fail_updates: true,
            ..FakeRecords::default()
        };
        records.push(1, "延岡店", "2024-01-01", 1, 1);
        let text = "西の丸延岡店\nP  計   5\nS  計   3\n";
        let result = apply_report(&records, text, &AliasTable::builtin(), &ReportFormat::default());
        assert!(result.is_err());
    }

    #[test]
    fn outcome_serializes_with_status_tag() {
        let outcome = Outcome::NoUnresolvedRecord {
            store: "門川".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "no_unresolved_record");
        assert_eq!(json["store"], "門川");
    }
}
