//! CSV import for the store sheet and historical compliance records.
//!
//! Files come from spreadsheet exports: optional UTF-8 BOM, comma separated,
//! double-quoted fields with `""` escapes. Only column presence is checked;
//! cell values are converted as they are read.

use std::collections::HashMap;

use chrono::NaiveDate;

use crate::{CategoryCounts, ComplianceRates, MaskError, NewStore, Result, StoreId, StoreKind};

pub(crate) const STORE_COLUMNS: &[&str] = &["store_name", "area", "type"];

pub(crate) const RECORD_COLUMNS: &[&str] = &[
    "store_id",
    "date",
    "year",
    "month",
    "pachinko_no_mask",
    "slot_no_mask",
    "total_no_mask",
    "pachinko_active",
    "slot_active",
    "total_active",
    "pachinko_mask_rate",
    "slot_mask_rate",
    "total_mask_rate",
];

/// One record row, kept as exported (totals and rates are not recomputed).
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ImportedRecord {
    pub(crate) line: usize,
    pub(crate) store_id: StoreId,
    pub(crate) date: NaiveDate,
    pub(crate) year: i32,
    pub(crate) month: u32,
    pub(crate) no_mask: CategoryCounts,
    pub(crate) total_no_mask: u64,
    pub(crate) pachinko_active: Option<u32>,
    pub(crate) slot_active: Option<u32>,
    pub(crate) total_active: Option<u32>,
    pub(crate) rates: ComplianceRates,
}

// ── CsvTable ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) struct CsvTable {
    columns: HashMap<String, usize>,
    rows: Vec<(usize, Vec<String>)>,
}

impl CsvTable {
    pub(crate) fn parse(text: &str) -> Result<Self> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut records = split_records(text)?.into_iter();
        let Some((_, header)) = records.next() else {
            return Err(MaskError::Csv {
                line: 1,
                reason: "file is empty".to_string(),
            });
        };
        let columns = header
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.trim().to_string(), idx))
            .collect();
        let rows = records
            .filter(|(_, fields)| fields.iter().any(|f| !f.trim().is_empty()))
            .collect();
        Ok(Self { columns, rows })
    }

    pub(crate) fn require_columns(&self, required: &[&str]) -> Result<()> {
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|c| !self.columns.contains_key(*c))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(MaskError::Csv {
            line: 1,
            reason: format!("missing columns: {}", missing.join(", ")),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    fn cell<'a>(&self, fields: &'a [String], column: &str) -> &'a str {
        self.columns
            .get(column)
            .and_then(|idx| fields.get(*idx))
            .map(|s| s.trim())
            .unwrap_or("")
    }
}

/// Split into (line number, fields). Quoted fields may span lines.
fn split_records(text: &str) -> Result<Vec<(usize, Vec<String>)>> {
    let mut out = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            '\r' if !in_quotes => {}
            '\n' if !in_quotes => {
                fields.push(std::mem::take(&mut field));
                out.push((record_line, std::mem::take(&mut fields)));
                line += 1;
                record_line = line;
            }
            '\n' => {
                field.push('\n');
                line += 1;
            }
            _ => field.push(ch),
        }
    }
    if in_quotes {
        return Err(MaskError::Csv {
            line: record_line,
            reason: "unterminated quoted field".to_string(),
        });
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        out.push((record_line, fields));
    }
    Ok(out)
}

// ── Cell conversion ──────────────────────────────────────────────────────

/// Spreadsheet exports write integer columns containing blanks as `5.0`.
fn parse_count(raw: &str, line: usize, column: &str) -> Result<Option<u32>> {
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    if let Ok(v) = raw.parse::<u32>() {
        return Ok(Some(v));
    }
    match raw.parse::<f64>() {
        Ok(v) if v >= 0.0 && v.fract() == 0.0 && v <= f64::from(u32::MAX) => Ok(Some(v as u32)),
        _ => Err(MaskError::Csv {
            line,
            reason: format!("{column}: not a count: {raw:?}"),
        }),
    }
}

fn require_count(raw: &str, line: usize, column: &str) -> Result<u32> {
    parse_count(raw, line, column)?.ok_or_else(|| MaskError::Csv {
        line,
        reason: format!("{column} is required"),
    })
}

fn parse_rate(raw: &str, line: usize, column: &str) -> Result<Option<f64>> {
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    raw.parse::<f64>().map(Some).map_err(|_| MaskError::Csv {
        line,
        reason: format!("{column}: not a number: {raw:?}"),
    })
}

// ── Entry points ─────────────────────────────────────────────────────────

pub(crate) fn parse_store_csv(text: &str) -> Result<Vec<NewStore>> {
    let table = CsvTable::parse(text)?;
    table.require_columns(STORE_COLUMNS)?;
    let mut stores = Vec::with_capacity(table.len());
    for (line, fields) in &table.rows {
        let name = table.cell(fields, "store_name");
        if name.is_empty() {
            return Err(MaskError::Csv {
                line: *line,
                reason: "store_name is empty".to_string(),
            });
        }
        let kind_raw = table.cell(fields, "type");
        let kind = StoreKind::parse(kind_raw).ok_or_else(|| MaskError::Csv {
            line: *line,
            reason: format!("unknown type {kind_raw:?}"),
        })?;
        stores.push(NewStore {
            name: name.to_string(),
            area: table.cell(fields, "area").to_string(),
            kind,
        });
    }
    Ok(stores)
}

pub(crate) fn parse_record_csv(text: &str) -> Result<Vec<ImportedRecord>> {
    let table = CsvTable::parse(text)?;
    table.require_columns(RECORD_COLUMNS)?;
    let mut records = Vec::with_capacity(table.len());
    for (line, fields) in &table.rows {
        let line = *line;
        let cell = |column: &str| table.cell(fields, column);

        let store_id = cell("store_id").parse::<StoreId>().map_err(|_| MaskError::Csv {
            line,
            reason: format!("store_id: not an id: {:?}", cell("store_id")),
        })?;
        let date = crate::parse_date(cell("date")).ok_or_else(|| MaskError::Csv {
            line,
            reason: format!("date: unrecognised {:?}", cell("date")),
        })?;
        let no_mask = CategoryCounts::new(
            require_count(cell("pachinko_no_mask"), line, "pachinko_no_mask")?,
            require_count(cell("slot_no_mask"), line, "slot_no_mask")?,
        );
        let total_no_mask =
            parse_count(cell("total_no_mask"), line, "total_no_mask")?
                .map(u64::from)
                .unwrap_or(no_mask.total());
        let year = parse_count(cell("year"), line, "year")?
            .map(|y| y as i32)
            .unwrap_or_else(|| chrono::Datelike::year(&date));
        let month = parse_count(cell("month"), line, "month")?
            .unwrap_or_else(|| chrono::Datelike::month(&date));

        records.push(ImportedRecord {
            line,
            store_id,
            date,
            year,
            month,
            no_mask,
            total_no_mask,
            pachinko_active: parse_count(cell("pachinko_active"), line, "pachinko_active")?,
            slot_active: parse_count(cell("slot_active"), line, "slot_active")?,
            total_active: parse_count(cell("total_active"), line, "total_active")?,
            rates: ComplianceRates {
                pachinko: parse_rate(cell("pachinko_mask_rate"), line, "pachinko_mask_rate")?,
                slot: parse_rate(cell("slot_mask_rate"), line, "slot_mask_rate")?,
                total: parse_rate(cell("total_mask_rate"), line, "total_mask_rate")?,
            },
        });
    }
    Ok(records)
}
