use std::collections::HashMap;

use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

use crate::db;
use crate::draft::{DraftKey, DraftRow, DraftStore};
use crate::ipc::error::{err, flash, ok};
use crate::ipc::types::{AppState, Request};
use crate::plan;
use crate::resolve::{self, ExamDescriptor};
use crate::rowcheck::{self, ValidatedRow};
use crate::tabular::NormalizedRow;

// Manual score entry: the operator types results straight into the class
// roster instead of uploading a sheet. Failed submits park their raw values
// and errors in the draft store, keyed by exactly the view that was open, so
// the next render of that view shows the operator what to fix.

/// The exam half of a manual-entry request: an explicit session id, or a
/// descriptive tuple that may auto-create the session on submit.
enum ExamSelector {
    ById(i64),
    ByDescriptor(ExamDescriptor),
}

impl ExamSelector {
    /// Stable string form for the draft key.
    fn draft_tag(&self) -> String {
        match self {
            ExamSelector::ById(id) => format!("exam:{}", id),
            ExamSelector::ByDescriptor(d) => format!(
                "desc:{}|{}|{}|{}|{}",
                d.study_year, d.kind, d.title, d.date, d.attempt
            ),
        }
    }
}

fn parse_exam(params: &serde_json::Value) -> Result<ExamSelector, String> {
    let Some(exam) = params.get("exam") else {
        return Err("missing params.exam".to_string());
    };
    if let Some(id) = exam.get("examSessionId").and_then(|v| v.as_i64()) {
        if id < 1 {
            return Err("examSessionId must be positive".to_string());
        }
        return Ok(ExamSelector::ById(id));
    }
    let get = |key: &str| {
        exam.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };
    Ok(ExamSelector::ByDescriptor(ExamDescriptor {
        study_year: get("studyYear"),
        kind: get("kind"),
        title: get("title"),
        date: get("date"),
        attempt: exam.get("attempt").and_then(|v| v.as_i64()).unwrap_or(1),
    }))
}

fn parse_view_key(params: &serde_json::Value) -> Result<(String, ExamSelector, String), String> {
    let scope = params
        .get("scope")
        .and_then(|v| v.get("className"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| "missing params.scope.className".to_string())?;
    let exam = parse_exam(params)?;
    let search = params
        .get("search")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    Ok((scope, exam, search))
}

fn handle_manual_view(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (scope, exam, search) = match parse_view_key(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let pupils = match db::pupils_in_scope(conn, &scope, &search) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Splice in (and thereby consume) the draft from the last failed submit
    // of this exact view.
    let key = DraftKey {
        scope: scope.clone(),
        exam: exam.draft_tag(),
        search: search.clone(),
    };
    let mut draft_rows = state
        .drafts
        .take(&key, Utc::now())
        .map(|e| e.rows)
        .unwrap_or_default();

    let rows: Vec<serde_json::Value> = pupils
        .iter()
        .map(|p| {
            let majors = match (p.major1_subject_id, p.major2_subject_id) {
                (Some(a), Some(b)) => json!({
                    "major1SubjectId": a,
                    "major2SubjectId": b
                }),
                _ => serde_json::Value::Null,
            };
            let draft = draft_rows.remove(&p.id);
            json!({
                "pupilId": p.id,
                "fullName": p.full_name,
                "majors": majors,
                "draft": draft,
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "scope": scope,
            "search": search,
            "rows": rows,
        }),
    )
}

struct SubmittedRow {
    pupil_id: i64,
    values: HashMap<String, String>,
}

fn parse_rows(params: &serde_json::Value) -> Result<Vec<SubmittedRow>, String> {
    let Some(arr) = params.get("rows").and_then(|v| v.as_array()) else {
        return Err("missing rows[]".to_string());
    };
    let mut out = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        let Some(pupil_id) = item.get("pupilId").and_then(|v| v.as_i64()) else {
            return Err(format!("row at index {} missing pupilId", i));
        };
        let mut values: HashMap<String, String> = HashMap::new();
        if let Some(obj) = item.get("values").and_then(|v| v.as_object()) {
            for (k, v) in obj {
                let text = match v {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                values.insert(k.clone(), text);
            }
        }
        out.push(SubmittedRow {
            pupil_id,
            values,
        });
    }
    Ok(out)
}

fn validate_submitted(
    conn: &Connection,
    submitted: &[SubmittedRow],
    exam_session_id: i64,
) -> anyhow::Result<Vec<ValidatedRow>> {
    let mut rows: Vec<ValidatedRow> = submitted
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let mut fields = s.values.clone();
            fields.insert("pupil_id".to_string(), s.pupil_id.to_string());
            let row = NormalizedRow {
                line: i + 1,
                fields,
            };
            rowcheck::validate_row(&row, Some(exam_session_id))
        })
        .collect();
    resolve::resolve_rows(conn, &mut rows)?;
    Ok(rows)
}

fn handle_manual_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (scope, exam, search) = match parse_view_key(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let submitted = match parse_rows(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    // Resolve the exam session up front; the descriptor path auto-creates,
    // but only for a complete tuple.
    let exam_session_id = match &exam {
        ExamSelector::ById(id) => {
            match db::fetch_exam_ids(conn, &[*id]) {
                Ok(known) if known.contains(id) => *id,
                Ok(_) => return err(&req.id, "not_found", "exam not found", None),
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }
        ExamSelector::ByDescriptor(desc) => {
            if let Err(msg) = desc.check_complete() {
                return err(
                    &req.id,
                    "bad_params",
                    format!("cannot create exam session: {}", msg),
                    None,
                );
            }
            match db::find_or_create_exam_session(conn, desc) {
                Ok(id) => id,
                Err(e) => return err(&req.id, "db_insert_failed", e.to_string(), None),
            }
        }
    };

    let rows = match validate_submitted(conn, &submitted, exam_session_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (reports, totals) = match plan::plan(conn, &rows) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let key = DraftKey {
        scope: scope.clone(),
        exam: exam.draft_tag(),
        search,
    };

    if totals.error > 0 {
        // Park exactly what was typed, per pupil, for the next render of
        // this view.
        let mut draft: HashMap<i64, DraftRow> = HashMap::new();
        for (row, sub) in rows.iter().zip(submitted.iter()) {
            if row.errors.is_empty() {
                continue;
            }
            draft.insert(
                sub.pupil_id,
                DraftRow {
                    values: sub.values.clone(),
                    errors: row.errors.clone(),
                },
            );
        }
        state.drafts.put(key, draft, Utc::now());
        return ok(
            &req.id,
            json!({
                "saved": false,
                "totals": totals,
                "rows": reports,
                "flash": flash("error", format!(
                    "{} rows need fixing; nothing was saved",
                    totals.error
                )),
            }),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut write_err: Option<anyhow::Error> = None;
    for row in &rows {
        let Some(w) = plan::to_write(row) else {
            continue;
        };
        if let Err(e) = db::upsert_result(&tx, &w) {
            write_err = Some(e);
            break;
        }
    }
    if let Some(e) = write_err {
        let _ = tx.rollback();
        let correlation = Uuid::new_v4().to_string();
        tracing::error!(correlation = %correlation, error = ?e, "manual entry batch failed");
        return err(
            &req.id,
            "tx_failed",
            "save failed; nothing was written",
            Some(json!({ "correlationId": correlation })),
        );
    }
    if let Err(e) = tx.commit() {
        let correlation = Uuid::new_v4().to_string();
        tracing::error!(correlation = %correlation, error = ?e, "manual entry commit failed");
        return err(
            &req.id,
            "tx_failed",
            "save failed; nothing was written",
            Some(json!({ "correlationId": correlation })),
        );
    }

    // A fully successful submit clears its own draft unconditionally.
    state.drafts.clear(&key);

    ok(
        &req.id,
        json!({
            "saved": true,
            "examSessionId": exam_session_id,
            "inserted": totals.insert,
            "updated": totals.update,
            "totals": totals,
            "flash": flash("success", format!(
                "saved {} results ({} inserted, {} updated)",
                totals.insert + totals.update,
                totals.insert,
                totals.update
            )),
            "view": {
                "method": "otm.manualView",
                "params": { "scope": { "className": scope }, "exam": req.params.get("exam") }
            },
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "otm.manualView" => Some(handle_manual_view(state, req)),
        "otm.manualSubmit" => Some(handle_manual_submit(state, req)),
        _ => None,
    }
}
