mod test_support;

use serde_json::json;
use test_support::{request_ok, result_count, seed_reference, spawn_sidecar, temp_dir};

#[test]
fn preview_then_commit_roundtrip_with_localized_headers() {
    let workspace = temp_dir("otmd-preview-commit");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let exam_id = seed_reference(&mut stdin, &mut reader);

    let text = "pupil_id\tFan 1\tFan 2\tOna tili\tMatematika\tTarix\n\
                101\t30\t25\t9\t8\t10\n\
                102\t28\t30\t10\t10\t9\n";
    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "otm.preview",
        json!({ "text": text, "defaultExamId": exam_id }),
    );
    let token = preview
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string();
    assert_eq!(preview.pointer("/totals/rows").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(preview.pointer("/totals/error").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(preview.pointer("/totals/insert").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(
        preview.pointer("/rows/0/action").and_then(|v| v.as_str()),
        Some("insert")
    );

    // Preview alone writes nothing.
    assert_eq!(result_count(&workspace), 0);

    let committed = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "otm.commit",
        json!({ "token": token }),
    );
    assert_eq!(committed.get("inserted").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(committed.get("updated").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(
        committed.pointer("/flash/type").and_then(|v| v.as_str()),
        Some("success")
    );
    assert_eq!(result_count(&workspace), 2);

    // The consumed token is gone; the artifact was reclaimed with it.
    let _ = test_support::request_err(
        &mut stdin,
        &mut reader,
        "4",
        "otm.commit",
        json!({ "token": token }),
        "context_unknown",
    );
}

#[test]
fn blank_rows_skip_and_totals_reflect_them() {
    let workspace = temp_dir("otmd-skip-rows");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let exam_id = seed_reference(&mut stdin, &mut reader);

    // Semicolon-delimited paste with a fully blank line in the middle.
    let text = "pupil_id;major1;major2;mandatory1;mandatory2;mandatory3\n\
                101;30;25;9;8;10\n\
                ;;;;;\n\
                102;28;30;10;10;9\n";
    let preview = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "otm.preview",
        json!({ "text": text, "defaultExamId": exam_id }),
    );
    // Fully blank rows are dropped before counting, not reported as skip.
    assert_eq!(preview.pointer("/totals/rows").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(preview.pointer("/totals/skip").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(preview.pointer("/totals/valid").and_then(|v| v.as_u64()), Some(2));
}

#[test]
fn preview_without_rows_is_a_pipeline_error() {
    let workspace = temp_dir("otmd-no-rows");
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
        "otm.preview",
        json!({ "text": "pupil_id,major1,major2\n" }),
        "no_rows",
    );
}

#[test]
fn unsupported_artifact_type_is_rejected_before_parsing() {
    let workspace = temp_dir("otmd-bad-artifact");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let bogus = workspace.join("scores.exe");
    std::fs::write(&bogus, b"MZ").expect("write bogus artifact");
    let _ = test_support::request_err(
        &mut stdin,
        &mut reader,
        "2",
        "otm.preview",
        json!({ "path": bogus.to_string_lossy() }),
        "bad_artifact",
    );
}
