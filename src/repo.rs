//! Collaborator interfaces used by the ingestion run.
//!
//! The recorder only needs to find the latest unresolved record for a store
//! and write attendance back onto it. `MaskDb` implements both traits against
//! SQLite; tests plug in in-memory fakes.

use chrono::NaiveDate;

use crate::{CategoryCounts, ComplianceRates, RecordId, Result, Store};

/// A record still waiting for attendance figures.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct UnresolvedRecord {
    pub(crate) id: RecordId,
    pub(crate) store_name: String,
    pub(crate) date: NaiveDate,
    pub(crate) no_mask: CategoryCounts,
}

/// Attendance and derived rates written onto a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct AttendanceUpdate {
    pub(crate) active: CategoryCounts,
    pub(crate) rates: ComplianceRates,
}

pub(crate) trait StoreRegistry {
    /// Exact match on the canonical store name.
    fn find_store_by_name(&self, name: &str) -> Result<Option<Store>>;

    fn list_stores(&self) -> Result<Vec<Store>>;
}

pub(crate) trait RecordStore {
    /// Most recent record (by date, then id) for `store_name` that lacks attendance.
    fn find_latest_unresolved(&self, store_name: &str) -> Result<Option<UnresolvedRecord>>;

    fn update_attendance_and_rates(
        &self,
        record_id: RecordId,
        update: &AttendanceUpdate,
    ) -> Result<()>;
}
