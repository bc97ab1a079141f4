use serde::Serialize;

use crate::tabular::NormalizedRow;

/// Tri-state per field: blank input is a distinct state, not an error, so
/// "row is skip iff every field is blank" is checkable by construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<T> {
    Blank,
    Invalid(String),
    Valid(T),
}

impl<T: Copy> Field<T> {
    pub fn value(&self) -> Option<T> {
        match self {
            Field::Valid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_blank(&self) -> bool {
        matches!(self, Field::Blank)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

/// One row after parsing and range checks. `errors` also accumulates
/// resolution-stage errors; a row is writable only when it stays empty.
#[derive(Debug, Clone)]
pub struct ValidatedRow {
    pub line: usize,
    pub pupil_id: Field<i64>,
    pub major1: Field<i64>,
    pub major2: Field<i64>,
    pub mandatory1: Field<i64>,
    pub mandatory2: Field<i64>,
    pub mandatory3: Field<i64>,
    pub cert1: Field<f64>,
    pub cert2: Field<f64>,
    pub exam_id: Field<i64>,
    pub skip: bool,
    pub errors: Vec<FieldError>,
}

impl ValidatedRow {
    pub fn is_valid(&self) -> bool {
        !self.skip && self.errors.is_empty()
    }

    pub fn push_error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(FieldError {
            field: field.to_string(),
            message: message.into(),
        });
    }
}

pub const MAJOR_MAX: i64 = 30;
pub const MANDATORY_MAX: i64 = 10;

/// Parse and range-check one canonical row. Pure: no store access, no side
/// effects. `default_exam_id` is the caller-selected exam a row without an
/// explicit `exam_id` falls back to.
pub fn validate_row(row: &NormalizedRow, default_exam_id: Option<i64>) -> ValidatedRow {
    let raw = |key: &str| row.get(key).trim().to_string();

    // Skip is judged on the score fields alone: a roster row nobody typed
    // into stays a skip even though its pupil id is present, which is what
    // lets a partially filled sheet re-preview without an error flood.
    let all_blank = [
        "major1",
        "major2",
        "mandatory1",
        "mandatory2",
        "mandatory3",
        "cert1",
        "cert2",
    ]
    .iter()
    .all(|k| raw(k).is_empty());

    let mut out = ValidatedRow {
        line: row.line,
        pupil_id: Field::Blank,
        major1: Field::Blank,
        major2: Field::Blank,
        mandatory1: Field::Blank,
        mandatory2: Field::Blank,
        mandatory3: Field::Blank,
        cert1: Field::Blank,
        cert2: Field::Blank,
        exam_id: Field::Blank,
        skip: all_blank,
        errors: Vec::new(),
    };
    if all_blank {
        return out;
    }

    out.pupil_id = parse_count(&raw("pupil_id"), 1, i64::MAX, "pupil id");
    out.major1 = parse_count(&raw("major1"), 0, MAJOR_MAX, "major score");
    out.major2 = parse_count(&raw("major2"), 0, MAJOR_MAX, "major score");
    out.mandatory1 = parse_count(&raw("mandatory1"), 0, MANDATORY_MAX, "mandatory score");
    out.mandatory2 = parse_count(&raw("mandatory2"), 0, MANDATORY_MAX, "mandatory score");
    out.mandatory3 = parse_count(&raw("mandatory3"), 0, MANDATORY_MAX, "mandatory score");
    out.cert1 = parse_percent(&raw("cert1"));
    out.cert2 = parse_percent(&raw("cert2"));
    out.exam_id = parse_count(&raw("exam_id"), 1, i64::MAX, "exam id");

    // Counts are required on a non-blank row; certificates are always
    // optional; the exam may come from the caller's default selection.
    for (name, field) in [
        ("pupil_id", &mut out.pupil_id),
        ("major1", &mut out.major1),
        ("major2", &mut out.major2),
        ("mandatory1", &mut out.mandatory1),
        ("mandatory2", &mut out.mandatory2),
        ("mandatory3", &mut out.mandatory3),
    ] {
        if field.is_blank() {
            *field = Field::Invalid(format!("{} is required", name));
        }
    }
    if out.exam_id.is_blank() {
        out.exam_id = match default_exam_id {
            Some(id) => Field::Valid(id),
            None => Field::Invalid("exam is required".to_string()),
        };
    }

    collect_errors(&mut out);
    out
}

fn collect_errors(row: &mut ValidatedRow) {
    let mut errors: Vec<FieldError> = Vec::new();
    let mut push = |field: &str, f: &Field<i64>| {
        if let Field::Invalid(msg) = f {
            errors.push(FieldError {
                field: field.to_string(),
                message: msg.clone(),
            });
        }
    };
    push("pupil_id", &row.pupil_id);
    push("major1", &row.major1);
    push("major2", &row.major2);
    push("mandatory1", &row.mandatory1);
    push("mandatory2", &row.mandatory2);
    push("mandatory3", &row.mandatory3);
    push("exam_id", &row.exam_id);
    for (name, f) in [("cert1", &row.cert1), ("cert2", &row.cert2)] {
        if let Field::Invalid(msg) = f {
            errors.push(FieldError {
                field: name.to_string(),
                message: msg.clone(),
            });
        }
    }
    row.errors.extend(errors);
}

/// Unsigned-integer field with an inclusive range.
fn parse_count(raw: &str, min: i64, max: i64, what: &str) -> Field<i64> {
    if raw.is_empty() {
        return Field::Blank;
    }
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Field::Invalid(format!("{} must be a whole number", what));
    }
    let Ok(v) = raw.parse::<i64>() else {
        return Field::Invalid(format!("{} is out of range", what));
    };
    if v < min || v > max {
        if max == i64::MAX {
            return Field::Invalid(format!("{} must be at least {}", what, min));
        }
        return Field::Invalid(format!("{} must be between {} and {}", what, min, max));
    }
    Field::Valid(v)
}

/// Certificate-equivalence percentage: 0..=100, up to two decimals, comma or
/// dot as the separator. Blank means "not supplied".
fn parse_percent(raw: &str) -> Field<f64> {
    if raw.is_empty() {
        return Field::Blank;
    }
    let normalized = raw.replace(',', ".");
    let (int_part, frac_part) = match normalized.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (normalized.as_str(), None),
    };
    let digits_ok = !int_part.is_empty()
        && int_part.bytes().all(|b| b.is_ascii_digit())
        && frac_part
            .map(|f| !f.is_empty() && f.len() <= 2 && f.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(true);
    if !digits_ok {
        return Field::Invalid("percentage must be a number with at most two decimals".to_string());
    }
    let Ok(v) = normalized.parse::<f64>() else {
        return Field::Invalid("percentage is out of range".to_string());
    };
    if !(0.0..=100.0).contains(&v) {
        return Field::Invalid("percentage must be between 0 and 100".to_string());
    }
    Field::Valid(v)
}
