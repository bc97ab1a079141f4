use std::collections::HashSet;

use chrono::NaiveDate;
use rusqlite::Connection;

use crate::db;
use crate::rowcheck::{Field, ValidatedRow};

/// A pupil as the pipeline sees it: identity plus the active major
/// assignment (or none).
#[derive(Debug, Clone)]
pub struct PupilRef {
    pub id: i64,
    pub full_name: String,
    pub class_name: String,
    pub major1_subject_id: Option<i64>,
    pub major2_subject_id: Option<i64>,
}

/// The descriptive tuple that identifies an exam session when no id is given.
#[derive(Debug, Clone)]
pub struct ExamDescriptor {
    pub study_year: String,
    pub kind: String,
    pub title: String,
    pub date: String,
    pub attempt: i64,
}

pub const EXAM_KINDS: [&str; 2] = ["mock", "repetition"];

impl ExamDescriptor {
    /// Auto-creation is only permitted for a complete descriptor with a real
    /// date and a known kind.
    pub fn check_complete(&self) -> Result<(), String> {
        if self.study_year.trim().is_empty() || self.title.trim().is_empty() {
            return Err("study year and title are required".to_string());
        }
        if !EXAM_KINDS.contains(&self.kind.as_str()) {
            return Err(format!("kind must be one of: {}", EXAM_KINDS.join(", ")));
        }
        if NaiveDate::parse_from_str(&self.date, "%Y-%m-%d").is_err() {
            return Err(format!("invalid date: {:?}", self.date));
        }
        if self.attempt < 1 {
            return Err("attempt must be a positive integer".to_string());
        }
        Ok(())
    }
}

/// Resolve every row against the reference store, accumulating field-scoped
/// errors next to the validation ones. Lookups are batched over the distinct
/// id sets; rows are annotated in place and never dropped, so the operator
/// sees exactly which id failed.
pub fn resolve_rows(conn: &Connection, rows: &mut [ValidatedRow]) -> anyhow::Result<()> {
    let mut pupil_ids: Vec<i64> = Vec::new();
    let mut exam_ids: Vec<i64> = Vec::new();
    let mut seen_pupils: HashSet<i64> = HashSet::new();
    let mut seen_exams: HashSet<i64> = HashSet::new();
    for row in rows.iter() {
        if row.skip {
            continue;
        }
        if let Some(id) = row.pupil_id.value() {
            if seen_pupils.insert(id) {
                pupil_ids.push(id);
            }
        }
        if let Some(id) = row.exam_id.value() {
            if seen_exams.insert(id) {
                exam_ids.push(id);
            }
        }
    }

    let pupils = db::fetch_pupils(conn, &pupil_ids)?;
    let known_exams = db::fetch_exam_ids(conn, &exam_ids)?;

    for row in rows.iter_mut() {
        if row.skip {
            continue;
        }
        if let Field::Valid(pupil_id) = row.pupil_id {
            match pupils.get(&pupil_id) {
                None => row.push_error("pupil_id", "pupil not found"),
                Some(p) => match (p.major1_subject_id, p.major2_subject_id) {
                    (Some(a), Some(b)) if a != b => {}
                    (Some(_), Some(_)) => {
                        row.push_error("_major", "pupil's two major subjects are identical")
                    }
                    _ => row.push_error("_major", "pupil has no active major assignment"),
                },
            }
        }
        if let Field::Valid(exam_id) = row.exam_id {
            if !known_exams.contains(&exam_id) {
                row.push_error("exam_id", "exam not found");
            }
        }
    }
    Ok(())
}
