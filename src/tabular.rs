use std::collections::HashMap;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};

/// Canonical per-row schema for an OTM score import. Positional order is also
/// the column order assumed when the caller declares "no header".
pub const CANONICAL_FIELDS: [&str; 9] = [
    "pupil_id",
    "major1",
    "major2",
    "mandatory1",
    "mandatory2",
    "mandatory3",
    "cert1",
    "cert2",
    "exam_id",
];

pub const MAX_ARTIFACT_BYTES: u64 = 5 * 1024 * 1024;

const ALLOWED_EXTENSIONS: [&str; 7] = ["xlsx", "xlsm", "xls", "ods", "csv", "tsv", "txt"];

/// One data row keyed by canonical field name. `line` is the 1-based line in
/// the source artifact (header included), kept for error reporting.
#[derive(Debug, Clone)]
pub struct NormalizedRow {
    pub line: usize,
    pub fields: HashMap<String, String>,
}

impl NormalizedRow {
    pub fn get(&self, key: &str) -> &str {
        self.fields.get(key).map(|s| s.as_str()).unwrap_or("")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("no data rows")]
    NoRows,
    #[error("header row is empty")]
    EmptyHeader,
}

/// Normalized-alias -> canonical-field lookup. Built once at startup; a
/// duplicate alias in the table is a configuration error.
pub struct HeaderMap {
    aliases: HashMap<&'static str, &'static str>,
}

// Localized and shorthand column names seen in real OTM sheets. "fan" is the
// operator-facing word for a major subject; the three mandatory subjects are
// commonly written out by name.
const ALIAS_TABLE: [(&str, &str); 31] = [
    ("pupil_id", "pupil_id"),
    ("pupil", "pupil_id"),
    ("oquvchi", "pupil_id"),
    ("oquvchi_id", "pupil_id"),
    ("id", "pupil_id"),
    ("major1", "major1"),
    ("major_1", "major1"),
    ("fan1", "major1"),
    ("fan_1", "major1"),
    ("major2", "major2"),
    ("major_2", "major2"),
    ("fan2", "major2"),
    ("fan_2", "major2"),
    ("mandatory1", "mandatory1"),
    ("majburiy1", "mandatory1"),
    ("ona_tili", "mandatory1"),
    ("mandatory2", "mandatory2"),
    ("majburiy2", "mandatory2"),
    ("matematika", "mandatory2"),
    ("mandatory3", "mandatory3"),
    ("majburiy3", "mandatory3"),
    ("tarix", "mandatory3"),
    ("ozbekiston_tarixi", "mandatory3"),
    ("cert1", "cert1"),
    ("sertifikat1", "cert1"),
    ("sert_1", "cert1"),
    ("cert2", "cert2"),
    ("sertifikat2", "cert2"),
    ("sert_2", "cert2"),
    ("exam_id", "exam_id"),
    ("imtihon", "exam_id"),
];

impl HeaderMap {
    pub fn build() -> anyhow::Result<HeaderMap> {
        let mut aliases: HashMap<&'static str, &'static str> = HashMap::new();
        for (alias, canonical) in ALIAS_TABLE {
            if let Some(prev) = aliases.insert(alias, canonical) {
                if prev != canonical {
                    anyhow::bail!(
                        "ambiguous header alias {:?}: maps to both {:?} and {:?}",
                        alias,
                        prev,
                        canonical
                    );
                }
                anyhow::bail!("duplicate header alias {:?}", alias);
            }
        }
        Ok(HeaderMap { aliases })
    }

    /// Canonical key for one raw header cell. Unknown headers fall through as
    /// their normalized token so downstream code can still see them.
    pub fn canonical(&self, raw: &str) -> String {
        let token = normalize_token(raw);
        match self.aliases.get(token.as_str()) {
            Some(c) => (*c).to_string(),
            None => token,
        }
    }
}

/// Header token normalization: trim, strip BOM, lowercase, drop
/// quote/apostrophe variants, collapse other non-alphanumeric runs to a
/// single underscore, trim underscores.
pub fn normalize_token(raw: &str) -> String {
    let s = raw.trim_start_matches('\u{feff}').trim().to_lowercase();
    let mut out = String::with_capacity(s.len());
    let mut pending_sep = false;
    for ch in s.chars() {
        if matches!(ch, '\'' | '\u{2018}' | '\u{2019}' | '`' | '"' | '\u{201c}' | '\u{201d}') {
            continue;
        }
        if ch.is_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Read a stored artifact into a grid of cell texts. Spreadsheets go through
/// calamine (first sheet, formula cells come back as their cached values);
/// everything else is treated as pasted-style delimited text.
pub fn read_artifact(path: &Path) -> anyhow::Result<Vec<Vec<String>>> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "xlsx" | "xlsm" | "xls" | "ods" => read_spreadsheet(path),
        _ => {
            let bytes = std::fs::read(path)?;
            let text = String::from_utf8_lossy(&bytes);
            Ok(read_pasted(&text))
        }
    }
}

/// `true` when the file name/size pass the pre-parse guards.
pub fn check_artifact(name: &str, size: u64) -> Result<(), String> {
    if size > MAX_ARTIFACT_BYTES {
        return Err(format!(
            "artifact too large: {} bytes (max {})",
            size, MAX_ARTIFACT_BYTES
        ));
    }
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return Err(format!("unsupported artifact type: .{}", ext));
    }
    Ok(())
}

fn read_spreadsheet(path: &Path) -> anyhow::Result<Vec<Vec<String>>> {
    let mut workbook = open_workbook_auto(path)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow::anyhow!("workbook has no sheets"))??;

    let mut grid: Vec<Vec<String>> = Vec::new();
    for row in range.rows() {
        grid.push(row.iter().map(cell_text).collect());
    }
    Ok(grid)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty | Data::Error(_) => String::new(),
        Data::String(s) => s.trim().to_string(),
        // f64 Display already renders "30" for 30.0 and "12.5" for 12.50,
        // which is exactly the canonical decimal text we want.
        Data::Float(f) => format!("{}", f),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Data::DateTime(dt) => format!("{}", dt.as_f64()),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
    }
}

/// Parse pasted delimited text. The delimiter is chosen per line: a tab wins
/// outright, otherwise whichever of comma/semicolon occurs more often.
pub fn read_pasted(text: &str) -> Vec<Vec<String>> {
    let mut grid: Vec<Vec<String>> = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        let delim = detect_delimiter(line);
        grid.push(line.split(delim).map(|c| c.trim().to_string()).collect());
    }
    grid
}

fn detect_delimiter(line: &str) -> char {
    if line.contains('\t') {
        return '\t';
    }
    let commas = line.matches(',').count();
    let semis = line.matches(';').count();
    if semis > commas {
        ';'
    } else {
        ','
    }
}

/// Turn a raw grid into canonical-keyed rows. Drops fully blank rows, pads
/// ragged rows, and disambiguates duplicate header keys with a counter suffix
/// so a later column never overwrites an earlier one.
pub fn into_rows(
    grid: &[Vec<String>],
    has_header: bool,
    aliases: &HeaderMap,
) -> Result<Vec<NormalizedRow>, TableError> {
    let mut keys: Vec<String>;
    let data_start: usize;
    if has_header {
        let header = grid.first().ok_or(TableError::NoRows)?;
        keys = Vec::with_capacity(header.len());
        let mut seen: HashMap<String, usize> = HashMap::new();
        for cell in header {
            let key = aliases.canonical(cell);
            if key.is_empty() {
                keys.push(key);
                continue;
            }
            let n = seen.entry(key.clone()).or_insert(0);
            *n += 1;
            if *n == 1 {
                keys.push(key);
            } else {
                keys.push(format!("{}_{}", key, n));
            }
        }
        if keys.iter().all(|k| k.is_empty()) {
            return Err(TableError::EmptyHeader);
        }
        data_start = 1;
    } else {
        keys = CANONICAL_FIELDS.iter().map(|s| s.to_string()).collect();
        data_start = 0;
    }

    let mut rows: Vec<NormalizedRow> = Vec::new();
    for (i, cells) in grid.iter().enumerate().skip(data_start) {
        if cells.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        let mut fields: HashMap<String, String> = HashMap::with_capacity(cells.len());
        for (c, cell) in cells.iter().enumerate() {
            let key = match keys.get(c) {
                Some(k) if !k.is_empty() => k.clone(),
                // Extra or unnamed columns get positional keys; validation
                // ignores them.
                _ => format!("col_{}", c + 1),
            };
            fields.insert(key, cell.trim().to_string());
        }
        rows.push(NormalizedRow { line: i + 1, fields });
    }

    if rows.is_empty() {
        return Err(TableError::NoRows);
    }
    Ok(rows)
}
