#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

pub fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_otmd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn otmd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_raw(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request_raw(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Expect a refusal with the given error code; returns the error object.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    expect_code: &str,
) -> serde_json::Value {
    let value = request_raw(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    let error = value.get("error").cloned().expect("error object");
    assert_eq!(
        error.get("code").and_then(|v| v.as_str()),
        Some(expect_code),
        "unexpected error for {}: {}",
        method,
        error
    );
    error
}

/// Seed two subjects, two pupils in 11-A with major assignments, and one
/// mock exam session. Returns the exam session id.
pub fn seed_reference(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
) -> i64 {
    let _ = request_ok(
        stdin,
        reader,
        "seed-subjects",
        "reference.subjects.put",
        json!({ "subjects": [
            { "id": 1, "name": "Mathematics" },
            { "id": 2, "name": "Physics" }
        ]}),
    );
    let _ = request_ok(
        stdin,
        reader,
        "seed-pupils",
        "reference.pupils.put",
        json!({ "pupils": [
            { "id": 101, "fullName": "Aliyev Bekzod", "className": "11-A" },
            { "id": 102, "fullName": "Karimova Nilufar", "className": "11-A" }
        ]}),
    );
    for (id, pupil, m1, m2) in [("seed-m1", 101, 1, 2), ("seed-m2", 102, 2, 1)] {
        let _ = request_ok(
            stdin,
            reader,
            id,
            "reference.majors.assign",
            json!({ "pupilId": pupil, "major1SubjectId": m1, "major2SubjectId": m2 }),
        );
    }
    let created = request_ok(
        stdin,
        reader,
        "seed-exam",
        "reference.examSessions.create",
        json!({
            "studyYear": "2025-2026",
            "kind": "mock",
            "title": "November mock",
            "date": "2025-11-20",
            "attempt": 1
        }),
    );
    created
        .get("examSessionId")
        .and_then(|v| v.as_i64())
        .expect("examSessionId")
}

pub fn result_count(workspace: &std::path::Path) -> i64 {
    let conn = rusqlite::Connection::open(workspace.join("otm.sqlite3")).expect("open db");
    conn.query_row("SELECT COUNT(*) FROM otm_results", [], |r| r.get(0))
        .expect("count")
}
