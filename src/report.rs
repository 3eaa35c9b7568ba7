//! Attendance report parsing.
//!
//! The daily attendance mail lists each parlour under its own heading line,
//! followed by a pachinko total line (`P  計 ...`) and a slot total line
//! (`S  計 ...`). Scanning is line oriented with one piece of state: the store
//! whose block is currently open and the two totals collected for it so far.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::CategoryCounts;

/// Report heading → canonical store name as registered in the store table.
pub(crate) const DEFAULT_ALIASES: &[(&str, &str)] = &[
    // 延岡地区
    ("西の丸センター", "センター"),
    ("西の丸延岡店", "延岡店"),
    ("西の丸古川店", "古川店"),
    ("サンクス恵比須店", "恵比須"),
    ("ファミリー三愛延岡店", "ファミリー三愛延岡店"),
    ("ダイナム宮崎延岡店 ゆったり館", "ダイナム宮崎延岡店 ゆったり館"),
    ("CORE21南延岡店", "CORE21南延岡店"),
    ("シリウス延岡店", "シリウス延岡店"),
    ("オーパス延岡店", "オーパス延岡店"),
    ("Super D’station39延岡店", "Super D’station39延岡店"),
    // 東児湯地区
    ("西の丸川南店", "川南"),
    // 日向地区
    ("西の丸門川店", "門川"),
    ("西の丸エーワン", "エーワン"),
    ("CORE21日向店", "CORE21日向店"),
    ("まるみつ日向店", "まるみつ日向店"),
    ("ダイナム宮崎日向店 ゆったり館", "ダイナム宮崎日向店"),
    ("ダイナム宮崎日向財光寺店 ゆったり館", "ダイナム宮崎日向財光寺店"),
    ("シルバーバック日向店", "シルバーバック日向店"),
    ("Super D’station39日向店", "Super D’station39日向店"),
];

// ── AliasTable ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub(crate) struct AliasTable {
    map: HashMap<String, String>,
}

impl AliasTable {
    pub(crate) fn builtin() -> Self {
        Self::with_overrides(&BTreeMap::new())
    }

    /// Built-in aliases with `overrides` layered on top; override entries win.
    pub(crate) fn with_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let mut map = HashMap::new();
        let entries = DEFAULT_ALIASES
            .iter()
            .map(|(label, store)| (*label, *store))
            .chain(overrides.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        for (label, store) in entries {
            let label = label.trim();
            let store = store.trim();
            if label.is_empty() || store.is_empty() {
                continue;
            }
            map.insert(label.to_string(), store.to_string());
        }
        Self { map }
    }

    pub(crate) fn resolve(&self, label: &str) -> Option<&str> {
        self.map.get(label).map(String::as_str)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    /// Entries sorted by label.
    pub(crate) fn entries(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .map
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        out.sort();
        out
    }
}

// ── ReportFormat ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReportFormat {
    pub(crate) marker_a: String,
    pub(crate) marker_b: String,
    /// Whitespace-separated token index holding the count.
    pub(crate) value_token: usize,
    /// Clear both totals once a block has been emitted.
    pub(crate) reset_after_emit: bool,
}

impl Default for ReportFormat {
    fn default() -> Self {
        Self {
            marker_a: "P  計".to_string(),
            marker_b: "S  計".to_string(),
            value_token: 2,
            reset_after_emit: false,
        }
    }
}

impl ReportFormat {
    /// Full-width digits (`１２０`) are read like their ASCII forms.
    fn extract_value(&self, line: &str) -> Option<u32> {
        let token = line.split_whitespace().nth(self.value_token)?;
        let ascii: String = token.chars().map(fold_fullwidth_digit).collect();
        ascii.parse::<u32>().ok()
    }
}

fn fold_fullwidth_digit(ch: char) -> char {
    match ch {
        '\u{ff10}'..='\u{ff19}' => {
            char::from_u32(u32::from(ch) - 0xff10 + u32::from('0')).unwrap_or(ch)
        }
        _ => ch,
    }
}

// ── Scan ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct Extraction {
    pub(crate) store: String,
    pub(crate) pachinko: u32,
    pub(crate) slot: u32,
}

impl Extraction {
    pub(crate) fn counts(&self) -> CategoryCounts {
        CategoryCounts::new(self.pachinko, self.slot)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LineEvent {
    SetStore(String),
    SetCategoryA(Option<u32>),
    SetCategoryB(Option<u32>),
    EmitExtraction(Extraction),
    Noop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct ScanState {
    current_store: Option<String>,
    pachinko: Option<u32>,
    slot: Option<u32>,
}

impl ScanState {
    pub(crate) fn current_store(&self) -> Option<&str> {
        self.current_store.as_deref()
    }

    /// Advance the scan by one raw line.
    pub(crate) fn step(
        &mut self,
        raw: &str,
        aliases: &AliasTable,
        format: &ReportFormat,
    ) -> LineEvent {
        let line = raw.trim();
        if line.is_empty() {
            return LineEvent::Noop;
        }

        if let Some(store) = aliases.resolve(line) {
            self.current_store = Some(store.to_string());
            self.pachinko = None;
            self.slot = None;
            return LineEvent::SetStore(store.to_string());
        }

        let Some(store) = self.current_store.as_ref() else {
            return LineEvent::Noop;
        };

        if line.starts_with(format.marker_a.as_str()) {
            self.pachinko = format.extract_value(line);
            return LineEvent::SetCategoryA(self.pachinko);
        }

        if line.starts_with(format.marker_b.as_str()) {
            self.slot = format.extract_value(line);
            let (Some(pachinko), Some(slot)) = (self.pachinko, self.slot) else {
                return LineEvent::SetCategoryB(self.slot);
            };
            let extraction = Extraction {
                store: store.clone(),
                pachinko,
                slot,
            };
            if format.reset_after_emit {
                self.pachinko = None;
                self.slot = None;
            }
            return LineEvent::EmitExtraction(extraction);
        }

        LineEvent::Noop
    }
}

/// Lazy sequence of completed store blocks, in line order.
pub(crate) struct Extractions<'a> {
    lines: std::str::Lines<'a>,
    state: ScanState,
    aliases: &'a AliasTable,
    format: &'a ReportFormat,
}

impl Iterator for Extractions<'_> {
    type Item = Extraction;

    fn next(&mut self) -> Option<Self::Item> {
        for line in self.lines.by_ref() {
            if let LineEvent::EmitExtraction(extraction) =
                self.state.step(line, self.aliases, self.format)
            {
                return Some(extraction);
            }
        }
        None
    }
}

pub(crate) fn extractions<'a>(
    text: &'a str,
    aliases: &'a AliasTable,
    format: &'a ReportFormat,
) -> Extractions<'a> {
    Extractions {
        lines: text.lines(),
        state: ScanState::default(),
        aliases,
        format,
    }
}

/// Every per-line event with the store block open after that line, for
/// diagnostics (`ingest --dry-run --trace`).
pub(crate) fn scan_events(
    text: &str,
    aliases: &AliasTable,
    format: &ReportFormat,
) -> Vec<(LineEvent, Option<String>)> {
    text.lines()
        .fold(
            (ScanState::default(), Vec::new()),
            |(mut state, mut events), line| {
                let event = state.step(line, aliases, format);
                events.push((event, state.current_store().map(str::to_string)));
                (state, events)
            },
        )
        .1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Vec<Extraction> {
        let aliases = AliasTable::builtin();
        let format = ReportFormat::default();
        extractions(text, &aliases, &format).collect()
    }

    fn ext(store: &str, pachinko: u32, slot: u32) -> Extraction {
        Extraction {
            store: store.to_string(),
            pachinko,
            slot,
        }
    }

    #[test]
    fn no_alias_lines_yield_nothing() {
        let text = "お疲れ様です。\nP  計   5\nS  計   3\n本日の稼働です";
        assert!(parse(text).is_empty());
    }

    #[test]
    fn well_formed_block_emits_once() {
        let text = "西の丸延岡店\nP  計   5\nS  計   3\n";
        assert_eq!(parse(text), vec![ext("延岡店", 5, 3)]);
    }

    #[test]
    fn multiple_blocks_in_line_order() {
        let text = "\
本日の稼働報告

西の丸延岡店
P  計   120
S  計   80

西の丸門川店
  P  計   40
  S  計   22
";
        assert_eq!(
            parse(text),
            vec![ext("延岡店", 120, 80), ext("門川", 40, 22)]
        );
    }

    #[test]
    fn malformed_category_a_suppresses_block() {
        let text = "西の丸延岡店\nP  計   --\nS  計   3\n";
        assert!(parse(text).is_empty());
    }

    #[test]
    fn fullwidth_digits_are_counts() {
        let text = "西の丸延岡店\nP  計   １２０\nS  計   ８０\n";
        assert_eq!(parse(text), vec![ext("延岡店", 120, 80)]);
        let text = "西の丸延岡店\nP  計   １2０\nS  計   8\n";
        assert_eq!(parse(text), vec![ext("延岡店", 120, 8)]);
    }

    #[test]
    fn full_range_counts_parse_and_rate_without_overflow() {
        let text = "西の丸延岡店\nP  計   4294967295\nS  計   1\n";
        let blocks = parse(text);
        assert_eq!(blocks, vec![ext("延岡店", u32::MAX, 1)]);
        assert_eq!(blocks[0].counts().total(), u64::from(u32::MAX) + 1);
        let rates = crate::ComplianceRates::compute(blocks[0].counts(), CategoryCounts::new(0, 0));
        assert_eq!(rates.total, Some(1.0));
        assert_eq!(parse("西の丸延岡店\nP  計   4294967296\nS  計   1\n"), vec![]);
    }

    #[test]
    fn malformed_category_b_suppresses_block() {
        let text = "西の丸延岡店\nP  計   5\nS  計   x\n";
        assert!(parse(text).is_empty());
    }

    #[test]
    fn missing_value_token_is_absent() {
        let text = "西の丸延岡店\nP  計\nS  計   3\n";
        assert!(parse(text).is_empty());
    }

    #[test]
    fn alias_line_clears_pending_totals() {
        // The P total belongs to the first store and must not leak into the second.
        let text = "西の丸延岡店\nP  計   5\n西の丸門川店\nS  計   3\n";
        assert!(parse(text).is_empty());
    }

    #[test]
    fn second_slot_line_reemits_with_stale_pachinko() {
        let text = "西の丸延岡店\nP  計   5\nS  計   3\nS  計   4\n";
        assert_eq!(parse(text), vec![ext("延岡店", 5, 3), ext("延岡店", 5, 4)]);
    }

    #[test]
    fn reset_after_emit_drops_second_slot_line() {
        let aliases = AliasTable::builtin();
        let format = ReportFormat {
            reset_after_emit: true,
            ..ReportFormat::default()
        };
        let text = "西の丸延岡店\nP  計   5\nS  計   3\nS  計   4\n";
        let out: Vec<_> = extractions(text, &aliases, &format).collect();
        assert_eq!(out, vec![ext("延岡店", 5, 3)]);
    }

    #[test]
    fn alias_must_match_whole_trimmed_line() {
        let text = "西の丸延岡店です\nP  計   5\nS  計   3\n";
        assert!(parse(text).is_empty());
        let text = "   西の丸延岡店   \nP  計   5\nS  計   3\n";
        assert_eq!(parse(text), vec![ext("延岡店", 5, 3)]);
    }

    #[test]
    fn scan_events_tags_each_line() {
        let aliases = AliasTable::builtin();
        let format = ReportFormat::default();
        let traced = scan_events("挨拶\n西の丸延岡店\n\nP  計   5\nS  計   3", &aliases, &format);
        assert_eq!(traced[0].1, None);
        assert_eq!(traced[4].1.as_deref(), Some("延岡店"));
        let events: Vec<LineEvent> = traced.into_iter().map(|(event, _)| event).collect();
        assert_eq!(
            events,
            vec![
                LineEvent::Noop,
                LineEvent::SetStore("延岡店".to_string()),
                LineEvent::Noop,
                LineEvent::SetCategoryA(Some(5)),
                LineEvent::EmitExtraction(ext("延岡店", 5, 3)),
            ]
        );
    }

    #[test]
    fn overrides_win_over_builtin() {
        let mut overrides = BTreeMap::new();
        overrides.insert("西の丸延岡店".to_string(), "延岡本店".to_string());
        overrides.insert("新店舗".to_string(), " 新店 ".to_string());
        let table = AliasTable::with_overrides(&overrides);
        assert_eq!(table.resolve("西の丸延岡店"), Some("延岡本店"));
        assert_eq!(table.resolve("新店舗"), Some("新店"));
        assert_eq!(table.len(), DEFAULT_ALIASES.len() + 1);
    }

    #[test]
    fn builtin_canonical_names_are_trimmed() {
        let table = AliasTable::builtin();
        assert_eq!(
            table.resolve("ダイナム宮崎日向店 ゆったり館"),
            Some("ダイナム宮崎日向店")
        );
        assert!(table.entries().iter().all(|(_, v)| v.trim() == *v));
    }
}
