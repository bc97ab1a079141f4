use std::collections::{HashMap, HashSet};

use rusqlite::Connection;
use serde::Serialize;

use crate::db::{self, ResultWrite};
use crate::rowcheck::{FieldError, ValidatedRow};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowAction {
    Insert,
    Update,
    Skip,
    Error,
}

/// Per-row preview line: what would happen to this row on commit.
#[derive(Debug, Clone, Serialize)]
pub struct RowReport {
    pub line: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pupil_id: Option<i64>,
    pub action: RowAction,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Totals {
    pub rows: usize,
    pub skip: usize,
    pub valid: usize,
    pub error: usize,
    pub insert: usize,
    pub update: usize,
}

/// Classify every row as insert / update / skip / error without touching the
/// store. Existence probes are batched per exam session.
pub fn plan(conn: &Connection, rows: &[ValidatedRow]) -> anyhow::Result<(Vec<RowReport>, Totals)> {
    // Group writable rows by exam session for one IN-probe per session.
    let mut by_exam: HashMap<i64, Vec<i64>> = HashMap::new();
    for row in rows {
        if !row.is_valid() {
            continue;
        }
        if let (Some(exam_id), Some(pupil_id)) = (row.exam_id.value(), row.pupil_id.value()) {
            by_exam.entry(exam_id).or_default().push(pupil_id);
        }
    }
    let mut existing: HashMap<i64, HashSet<i64>> = HashMap::new();
    for (exam_id, pupil_ids) in &by_exam {
        existing.insert(
            *exam_id,
            db::existing_result_pupils(conn, *exam_id, pupil_ids)?,
        );
    }

    let mut reports = Vec::with_capacity(rows.len());
    let mut totals = Totals::default();
    for row in rows {
        totals.rows += 1;
        let action = if row.skip {
            totals.skip += 1;
            RowAction::Skip
        } else if !row.errors.is_empty() {
            totals.error += 1;
            RowAction::Error
        } else {
            totals.valid += 1;
            let exists = match (row.exam_id.value(), row.pupil_id.value()) {
                (Some(e), Some(p)) => existing
                    .get(&e)
                    .map(|set| set.contains(&p))
                    .unwrap_or(false),
                _ => false,
            };
            if exists {
                totals.update += 1;
                RowAction::Update
            } else {
                totals.insert += 1;
                RowAction::Insert
            }
        };
        reports.push(RowReport {
            line: row.line,
            pupil_id: row.pupil_id.value(),
            action,
            errors: row.errors.clone(),
        });
    }
    Ok((reports, totals))
}

/// Writable payload for one fully valid row. `None` for skip rows, rows with
/// errors, or rows whose required fields somehow lack values.
pub fn to_write(row: &ValidatedRow) -> Option<ResultWrite> {
    if !row.is_valid() {
        return None;
    }
    Some(ResultWrite {
        pupil_id: row.pupil_id.value()?,
        exam_session_id: row.exam_id.value()?,
        major1: row.major1.value()?,
        major2: row.major2.value()?,
        mandatory1: row.mandatory1.value()?,
        mandatory2: row.mandatory2.value()?,
        mandatory3: row.mandatory3.value()?,
        cert1: row.cert1.value(),
        cert2: row.cert2.value(),
    })
}
