use std::collections::{HashMap, HashSet};
use std::path::Path;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use uuid::Uuid;

use crate::resolve::{ExamDescriptor, PupilRef};

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("otm.sqlite3");
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pupils(
            id INTEGER PRIMARY KEY,
            full_name TEXT NOT NULL,
            class_name TEXT NOT NULL,
            login TEXT UNIQUE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_pupils_class ON pupils(class_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS major_assignments(
            id TEXT PRIMARY KEY,
            pupil_id INTEGER NOT NULL,
            major1_subject_id INTEGER NOT NULL,
            major2_subject_id INTEGER NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            assigned_at TEXT NOT NULL,
            FOREIGN KEY(pupil_id) REFERENCES pupils(id),
            FOREIGN KEY(major1_subject_id) REFERENCES subjects(id),
            FOREIGN KEY(major2_subject_id) REFERENCES subjects(id),
            CHECK(major1_subject_id <> major2_subject_id)
        )",
        [],
    )?;
    // At most one active assignment per pupil; new assignments supersede.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_major_assignments_active
         ON major_assignments(pupil_id) WHERE active = 1",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_sessions(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            study_year TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('mock','repetition')),
            title TEXT NOT NULL,
            date TEXT NOT NULL,
            attempt INTEGER NOT NULL CHECK(attempt >= 1),
            UNIQUE(study_year, kind, title, date, attempt)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS otm_results(
            id TEXT PRIMARY KEY,
            pupil_id INTEGER NOT NULL,
            exam_session_id INTEGER NOT NULL,
            major1_correct INTEGER NOT NULL,
            major2_correct INTEGER NOT NULL,
            mandatory1_correct INTEGER NOT NULL,
            mandatory2_correct INTEGER NOT NULL,
            mandatory3_correct INTEGER NOT NULL,
            cert1_percent REAL,
            cert2_percent REAL,
            total_score REAL NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(pupil_id) REFERENCES pupils(id),
            FOREIGN KEY(exam_session_id) REFERENCES exam_sessions(id),
            UNIQUE(pupil_id, exam_session_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_otm_results_exam ON otm_results(exam_session_id)",
        [],
    )?;

    Ok(())
}

/// Batched pupil fetch with the active major assignment joined in. One query
/// for the whole id set; rows referencing unknown pupils simply get no entry.
pub fn fetch_pupils(conn: &Connection, ids: &[i64]) -> anyhow::Result<HashMap<i64, PupilRef>> {
    let mut out = HashMap::new();
    if ids.is_empty() {
        return Ok(out);
    }
    let placeholders = std::iter::repeat_n("?", ids.len()).collect::<Vec<_>>().join(",");
    let sql = format!(
        "SELECT p.id, p.full_name, p.class_name, ma.major1_subject_id, ma.major2_subject_id
         FROM pupils p
         LEFT JOIN major_assignments ma ON ma.pupil_id = p.id AND ma.active = 1
         WHERE p.id IN ({})",
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let bind: Vec<Value> = ids.iter().map(|id| Value::Integer(*id)).collect();
    let rows = stmt.query_map(params_from_iter(bind), |row| {
        Ok(PupilRef {
            id: row.get(0)?,
            full_name: row.get(1)?,
            class_name: row.get(2)?,
            major1_subject_id: row.get(3)?,
            major2_subject_id: row.get(4)?,
        })
    })?;
    for r in rows {
        let r = r?;
        out.insert(r.id, r);
    }
    Ok(out)
}

pub fn fetch_exam_ids(conn: &Connection, ids: &[i64]) -> anyhow::Result<HashSet<i64>> {
    let mut out = HashSet::new();
    if ids.is_empty() {
        return Ok(out);
    }
    let placeholders = std::iter::repeat_n("?", ids.len()).collect::<Vec<_>>().join(",");
    let sql = format!("SELECT id FROM exam_sessions WHERE id IN ({})", placeholders);
    let mut stmt = conn.prepare(&sql)?;
    let bind: Vec<Value> = ids.iter().map(|id| Value::Integer(*id)).collect();
    let rows = stmt.query_map(params_from_iter(bind), |row| row.get::<_, i64>(0))?;
    for r in rows {
        out.insert(r?);
    }
    Ok(out)
}

/// Insert-if-absent, else fetch, under the uniqueness constraint on the
/// descriptive tuple. A concurrent duplicate insert degrades to the re-fetch.
pub fn find_or_create_exam_session(conn: &Connection, desc: &ExamDescriptor) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO exam_sessions(study_year, kind, title, date, attempt)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(study_year, kind, title, date, attempt) DO NOTHING",
        (
            &desc.study_year,
            &desc.kind,
            &desc.title,
            &desc.date,
            desc.attempt,
        ),
    )?;
    let id: Option<i64> = conn
        .query_row(
            "SELECT id FROM exam_sessions
             WHERE study_year = ? AND kind = ? AND title = ? AND date = ? AND attempt = ?",
            (
                &desc.study_year,
                &desc.kind,
                &desc.title,
                &desc.date,
                desc.attempt,
            ),
            |r| r.get(0),
        )
        .optional()?;
    id.ok_or_else(|| anyhow::anyhow!("exam session vanished after insert"))
}

/// Which of `pupil_ids` already have a result for `exam_session_id`. Batched
/// existence probe for the planner; never mutates.
pub fn existing_result_pupils(
    conn: &Connection,
    exam_session_id: i64,
    pupil_ids: &[i64],
) -> anyhow::Result<HashSet<i64>> {
    let mut out = HashSet::new();
    if pupil_ids.is_empty() {
        return Ok(out);
    }
    let placeholders = std::iter::repeat_n("?", pupil_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT pupil_id FROM otm_results WHERE exam_session_id = ? AND pupil_id IN ({})",
        placeholders
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut bind: Vec<Value> = Vec::with_capacity(pupil_ids.len() + 1);
    bind.push(Value::Integer(exam_session_id));
    for id in pupil_ids {
        bind.push(Value::Integer(*id));
    }
    let rows = stmt.query_map(params_from_iter(bind), |row| row.get::<_, i64>(0))?;
    for r in rows {
        out.insert(r?);
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct ResultWrite {
    pub pupil_id: i64,
    pub exam_session_id: i64,
    pub major1: i64,
    pub major2: i64,
    pub mandatory1: i64,
    pub mandatory2: i64,
    pub mandatory3: i64,
    pub cert1: Option<f64>,
    pub cert2: Option<f64>,
}

/// OTM scoring: 3.1 points per first-major correct answer, 2.1 per
/// second-major, 1.1 per mandatory. Computed in tenths to keep the stored
/// total exact.
pub fn total_score(w: &ResultWrite) -> f64 {
    let tenths = w.major1 * 31
        + w.major2 * 21
        + (w.mandatory1 + w.mandatory2 + w.mandatory3) * 11;
    tenths as f64 / 10.0
}

/// Insert-or-update keyed by the natural key (pupil, exam session). Repeated
/// commits of an unchanged sheet land on the same row.
pub fn upsert_result(conn: &Connection, w: &ResultWrite) -> anyhow::Result<()> {
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO otm_results(
            id, pupil_id, exam_session_id,
            major1_correct, major2_correct,
            mandatory1_correct, mandatory2_correct, mandatory3_correct,
            cert1_percent, cert2_percent, total_score, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(pupil_id, exam_session_id) DO UPDATE SET
           major1_correct = excluded.major1_correct,
           major2_correct = excluded.major2_correct,
           mandatory1_correct = excluded.mandatory1_correct,
           mandatory2_correct = excluded.mandatory2_correct,
           mandatory3_correct = excluded.mandatory3_correct,
           cert1_percent = excluded.cert1_percent,
           cert2_percent = excluded.cert2_percent,
           total_score = excluded.total_score,
           updated_at = excluded.updated_at",
        (
            &id,
            w.pupil_id,
            w.exam_session_id,
            w.major1,
            w.major2,
            w.mandatory1,
            w.mandatory2,
            w.mandatory3,
            w.cert1,
            w.cert2,
            total_score(w),
            &now,
        ),
    )?;
    Ok(())
}

pub fn upsert_pupil(
    conn: &Connection,
    id: i64,
    full_name: &str,
    class_name: &str,
    login: Option<&str>,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO pupils(id, full_name, class_name, login)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           full_name = excluded.full_name,
           class_name = excluded.class_name,
           login = excluded.login",
        (id, full_name, class_name, login),
    )?;
    Ok(())
}

pub fn upsert_subject(conn: &Connection, id: i64, name: &str) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO subjects(id, name) VALUES(?, ?)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        (id, name),
    )?;
    Ok(())
}

/// Create a new active major assignment, superseding any previous one.
pub fn assign_majors(
    conn: &Connection,
    pupil_id: i64,
    major1_subject_id: i64,
    major2_subject_id: i64,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        major1_subject_id != major2_subject_id,
        "major subjects must differ"
    );
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "UPDATE major_assignments SET active = 0 WHERE pupil_id = ? AND active = 1",
        [pupil_id],
    )?;
    let id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    tx.execute(
        "INSERT INTO major_assignments(id, pupil_id, major1_subject_id, major2_subject_id, active, assigned_at)
         VALUES(?, ?, ?, ?, 1, ?)",
        (&id, pupil_id, major1_subject_id, major2_subject_id, &now),
    )?;
    tx.commit()?;
    Ok(())
}

/// Pupils in one class scope for the manual-entry screen, optionally filtered
/// by a case-insensitive name search.
pub fn pupils_in_scope(
    conn: &Connection,
    class_name: &str,
    search: &str,
) -> anyhow::Result<Vec<PupilRef>> {
    let pattern = format!("%{}%", search.trim().to_lowercase());
    let mut stmt = conn.prepare(
        "SELECT p.id, p.full_name, p.class_name, ma.major1_subject_id, ma.major2_subject_id
         FROM pupils p
         LEFT JOIN major_assignments ma ON ma.pupil_id = p.id AND ma.active = 1
         WHERE p.class_name = ? AND (? = '%%' OR LOWER(p.full_name) LIKE ?)
         ORDER BY p.full_name, p.id",
    )?;
    let rows = stmt.query_map((class_name, &pattern, &pattern), |row| {
        Ok(PupilRef {
            id: row.get(0)?,
            full_name: row.get(1)?,
            class_name: row.get(2)?,
            major1_subject_id: row.get(3)?,
            major2_subject_id: row.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}
