use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::resolve::{ExamDescriptor, EXAM_KINDS};
use serde_json::json;

// Thin seeding surface for the reference store the pipeline resolves
// against. The real CRUD screens live in the front end; this only has to be
// enough for a sidecar to receive pupils, subjects, assignments and sessions.

fn handle_pupils_put(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(items) = req.params.get("pupils").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing pupils[]", None);
    };

    let mut saved = 0usize;
    for (i, item) in items.iter().enumerate() {
        let id = item.get("id").and_then(|v| v.as_i64());
        let full_name = item.get("fullName").and_then(|v| v.as_str());
        let class_name = item.get("className").and_then(|v| v.as_str());
        let login = item.get("login").and_then(|v| v.as_str());
        let (Some(id), Some(full_name), Some(class_name)) = (id, full_name, class_name) else {
            return err(
                &req.id,
                "bad_params",
                format!("pupil at index {} needs id, fullName, className", i),
                None,
            );
        };
        if id < 1 {
            return err(
                &req.id,
                "bad_params",
                format!("pupil at index {} has non-positive id", i),
                None,
            );
        }
        if let Err(e) = db::upsert_pupil(conn, id, full_name, class_name, login) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "pupils" })),
            );
        }
        saved += 1;
    }
    ok(&req.id, json!({ "saved": saved }))
}

fn handle_subjects_put(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(items) = req.params.get("subjects").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing subjects[]", None);
    };

    let mut saved = 0usize;
    for (i, item) in items.iter().enumerate() {
        let id = item.get("id").and_then(|v| v.as_i64());
        let name = item.get("name").and_then(|v| v.as_str());
        let (Some(id), Some(name)) = (id, name) else {
            return err(
                &req.id,
                "bad_params",
                format!("subject at index {} needs id and name", i),
                None,
            );
        };
        if let Err(e) = db::upsert_subject(conn, id, name) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "subjects" })),
            );
        }
        saved += 1;
    }
    ok(&req.id, json!({ "saved": saved }))
}

fn handle_majors_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let pupil_id = match req.params.get("pupilId").and_then(|v| v.as_i64()) {
        Some(v) if v >= 1 => v,
        _ => return err(&req.id, "bad_params", "missing/invalid pupilId", None),
    };
    let major1 = match req.params.get("major1SubjectId").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing major1SubjectId", None),
    };
    let major2 = match req.params.get("major2SubjectId").and_then(|v| v.as_i64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing major2SubjectId", None),
    };
    if major1 == major2 {
        return err(&req.id, "bad_params", "major subjects must differ", None);
    }

    match db::assign_majors(conn, pupil_id, major1, major2) {
        Ok(()) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "major_assignments" })),
        ),
    }
}

fn handle_exam_sessions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let desc = ExamDescriptor {
        study_year: req
            .params
            .get("studyYear")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        kind: req
            .params
            .get("kind")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        title: req
            .params
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        date: req
            .params
            .get("date")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        attempt: req.params.get("attempt").and_then(|v| v.as_i64()).unwrap_or(1),
    };
    if let Err(msg) = desc.check_complete() {
        return err(
            &req.id,
            "bad_params",
            msg,
            Some(json!({ "kinds": EXAM_KINDS })),
        );
    }

    match db::find_or_create_exam_session(conn, &desc) {
        Ok(id) => ok(&req.id, json!({ "examSessionId": id })),
        Err(e) => err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exam_sessions" })),
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reference.pupils.put" => Some(handle_pupils_put(state, req)),
        "reference.subjects.put" => Some(handle_subjects_put(state, req)),
        "reference.majors.assign" => Some(handle_majors_assign(state, req)),
        "reference.examSessions.create" => Some(handle_exam_sessions_create(state, req)),
        _ => None,
    }
}
