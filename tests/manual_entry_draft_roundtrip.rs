mod test_support;

use serde_json::json;
use test_support::{request_ok, result_count, seed_reference, spawn_sidecar, temp_dir};

#[test]
fn failed_submit_parks_a_draft_and_the_view_consumes_it() {
    let workspace = temp_dir("otmd-manual-draft");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let exam_id = seed_reference(&mut stdin, &mut reader);

    // 31 is over the major cap; the untouched sibling row stays a skip.
    let submit = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "otm.manualSubmit",
        json!({
            "scope": { "className": "11-A" },
            "exam": { "examSessionId": exam_id },
            "rows": [
                { "pupilId": 101, "values": {
                    "major1": "31", "major2": "25",
                    "mandatory1": "9", "mandatory2": "8", "mandatory3": "10"
                }},
                { "pupilId": 102, "values": {} }
            ]
        }),
    );
    assert_eq!(submit.get("saved").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(submit.pointer("/totals/error").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(submit.pointer("/totals/skip").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(result_count(&workspace), 0);

    // First render of the same view splices the draft in.
    let view = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "otm.manualView",
        json!({
            "scope": { "className": "11-A" },
            "exam": { "examSessionId": exam_id }
        }),
    );
    let rows = view.get("rows").and_then(|v| v.as_array()).expect("rows");
    let drafted = rows
        .iter()
        .find(|r| r.pointer("/pupilId").and_then(|v| v.as_i64()) == Some(101))
        .expect("pupil 101 in roster");
    assert_eq!(
        drafted.pointer("/draft/values/major1").and_then(|v| v.as_str()),
        Some("31")
    );
    assert_eq!(
        drafted.pointer("/draft/errors/0/field").and_then(|v| v.as_str()),
        Some("major1")
    );
    let untouched = rows
        .iter()
        .find(|r| r.pointer("/pupilId").and_then(|v| v.as_i64()) == Some(102))
        .expect("pupil 102 in roster");
    assert!(untouched.get("draft").map(|v| v.is_null()).unwrap_or(true));

    // Drafts are read-once: the second render is clean.
    let view = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "otm.manualView",
        json!({
            "scope": { "className": "11-A" },
            "exam": { "examSessionId": exam_id }
        }),
    );
    let rows = view.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert!(rows
        .iter()
        .all(|r| r.get("draft").map(|v| v.is_null()).unwrap_or(true)));
}

#[test]
fn corrected_resubmit_saves_once_and_clears_the_draft() {
    let workspace = temp_dir("otmd-manual-resubmit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let exam_id = seed_reference(&mut stdin, &mut reader);

    let bad = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "otm.manualSubmit",
        json!({
            "scope": { "className": "11-A" },
            "exam": { "examSessionId": exam_id },
            "rows": [
                { "pupilId": 101, "values": {
                    "major1": "31", "major2": "25",
                    "mandatory1": "9", "mandatory2": "8", "mandatory3": "10"
                }}
            ]
        }),
    );
    assert_eq!(bad.get("saved").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(result_count(&workspace), 0);

    let good = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "otm.manualSubmit",
        json!({
            "scope": { "className": "11-A" },
            "exam": { "examSessionId": exam_id },
            "rows": [
                { "pupilId": 101, "values": {
                    "major1": "30", "major2": "25",
                    "mandatory1": "9", "mandatory2": "8", "mandatory3": "10",
                    "cert1": "87,5"
                }}
            ]
        }),
    );
    assert_eq!(good.get("saved").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(good.get("inserted").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(
        good.pointer("/view/method").and_then(|v| v.as_str()),
        Some("otm.manualView")
    );
    assert_eq!(result_count(&workspace), 1);

    // The success cleared the parked draft from the failed attempt.
    let view = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "otm.manualView",
        json!({
            "scope": { "className": "11-A" },
            "exam": { "examSessionId": exam_id }
        }),
    );
    let rows = view.get("rows").and_then(|v| v.as_array()).expect("rows");
    assert!(rows
        .iter()
        .all(|r| r.get("draft").map(|v| v.is_null()).unwrap_or(true)));
}

#[test]
fn descriptor_submit_auto_creates_the_session() {
    let workspace = temp_dir("otmd-manual-descriptor");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = seed_reference(&mut stdin, &mut reader);

    let saved = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "otm.manualSubmit",
        json!({
            "scope": { "className": "11-A" },
            "exam": {
                "studyYear": "2025-2026",
                "kind": "repetition",
                "title": "January retake",
                "date": "2026-01-15",
                "attempt": 1
            },
            "rows": [
                { "pupilId": 101, "values": {
                    "major1": "27", "major2": "22",
                    "mandatory1": "7", "mandatory2": "6", "mandatory3": "9"
                }}
            ]
        }),
    );
    assert_eq!(saved.get("saved").and_then(|v| v.as_bool()), Some(true));
    let session = saved
        .get("examSessionId")
        .and_then(|v| v.as_i64())
        .expect("examSessionId");
    assert!(session >= 1);
    assert_eq!(result_count(&workspace), 1);

    // Same descriptor again reuses the session instead of making a sibling.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "otm.manualSubmit",
        json!({
            "scope": { "className": "11-A" },
            "exam": {
                "studyYear": "2025-2026",
                "kind": "repetition",
                "title": "January retake",
                "date": "2026-01-15",
                "attempt": 1
            },
            "rows": [
                { "pupilId": 101, "values": {
                    "major1": "28", "major2": "22",
                    "mandatory1": "7", "mandatory2": "6", "mandatory3": "9"
                }}
            ]
        }),
    );
    assert_eq!(
        again.get("examSessionId").and_then(|v| v.as_i64()),
        Some(session)
    );
    assert_eq!(again.get("updated").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(result_count(&workspace), 1);
}

#[test]
fn incomplete_descriptor_is_refused_before_any_write() {
    let workspace = temp_dir("otmd-manual-incomplete");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = seed_reference(&mut stdin, &mut reader);

    let _ = test_support::request_err(
        &mut stdin,
        &mut reader,
        "2",
        "otm.manualSubmit",
        json!({
            "scope": { "className": "11-A" },
            "exam": { "studyYear": "2025-2026", "kind": "final", "title": "x", "date": "2025-11-20" },
            "rows": [
                { "pupilId": 101, "values": {
                    "major1": "27", "major2": "22",
                    "mandatory1": "7", "mandatory2": "6", "mandatory3": "9"
                }}
            ]
        }),
        "bad_params",
    );
    assert_eq!(result_count(&workspace), 0);
}
