use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::draft::{
    ContextStore, DraftStore, ImportContext, ImportOptions, ARTIFACT_TTL_SECS,
};
use crate::ipc::error::{err, flash, ok};
use crate::ipc::types::{AppState, Request};
use crate::plan::{self, RowReport, Totals};
use crate::resolve;
use crate::rowcheck::{self, ValidatedRow};
use crate::tabular::{self, TableError};

struct PipelineAbort {
    code: &'static str,
    message: String,
}

struct PipelineRun {
    rows: Vec<ValidatedRow>,
    reports: Vec<RowReport>,
    totals: Totals,
}

/// Full read -> normalize -> validate -> resolve -> plan pass over a stored
/// artifact. Read-only; both preview and commit run exactly this, so commit
/// always works from fresh resolution rather than a preview snapshot.
fn run_pipeline(
    conn: &Connection,
    aliases: &tabular::HeaderMap,
    artifact: &Path,
    opts: &ImportOptions,
) -> Result<PipelineRun, PipelineAbort> {
    let grid = tabular::read_artifact(artifact).map_err(|e| PipelineAbort {
        code: "bad_artifact",
        message: e.to_string(),
    })?;
    let normalized = tabular::into_rows(&grid, opts.has_header, aliases).map_err(|e| {
        PipelineAbort {
            code: match e {
                TableError::NoRows => "no_rows",
                TableError::EmptyHeader => "empty_header",
            },
            message: e.to_string(),
        }
    })?;

    let mut rows: Vec<ValidatedRow> = normalized
        .iter()
        .map(|r| rowcheck::validate_row(r, opts.default_exam_id))
        .collect();
    resolve::resolve_rows(conn, &mut rows).map_err(|e| PipelineAbort {
        code: "db_query_failed",
        message: e.to_string(),
    })?;
    let (reports, totals) = plan::plan(conn, &rows).map_err(|e| PipelineAbort {
        code: "db_query_failed",
        message: e.to_string(),
    })?;
    Ok(PipelineRun {
        rows,
        reports,
        totals,
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn parse_options(params: &serde_json::Value) -> ImportOptions {
    ImportOptions {
        has_header: params
            .get("hasHeader")
            .and_then(|v| v.as_bool())
            .unwrap_or(true),
        default_exam_id: params.get("defaultExamId").and_then(|v| v.as_i64()),
        scope: params
            .get("scope")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
    }
}

/// Store the uploaded bytes under a fresh token, preserving the extension so
/// the reader can dispatch on it later.
fn store_artifact(
    uploads: &Path,
    token: &str,
    source_name: &str,
    bytes: &[u8],
) -> anyhow::Result<PathBuf> {
    let ext = source_name.rsplit('.').next().unwrap_or("txt");
    let dest = uploads.join(format!("{}.{}", token, ext));
    std::fs::write(&dest, bytes)?;
    Ok(dest)
}

fn handle_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(uploads) = state.workspace.as_ref().map(|w| w.join("uploads")) else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    // Either a pasted text block or a path to an uploaded file.
    let (bytes, source_name) = if let Some(text) = req.params.get("text").and_then(|v| v.as_str())
    {
        (text.as_bytes().to_vec(), "pasted.txt".to_string())
    } else if let Some(path) = req.params.get("path").and_then(|v| v.as_str()) {
        let name = Path::new(path)
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("upload")
            .to_string();
        match std::fs::read(path) {
            Ok(b) => (b, name),
            Err(e) => {
                return err(
                    &req.id,
                    "bad_artifact",
                    e.to_string(),
                    Some(json!({ "path": path })),
                )
            }
        }
    } else {
        return err(&req.id, "bad_params", "missing params.text or params.path", None);
    };

    if let Err(msg) = tabular::check_artifact(&source_name, bytes.len() as u64) {
        return err(&req.id, "bad_artifact", msg, None);
    }

    let token = Uuid::new_v4().to_string();
    let artifact_path = match store_artifact(&uploads, &token, &source_name, &bytes) {
        Ok(p) => p,
        Err(e) => return err(&req.id, "workspace_io_failed", e.to_string(), None),
    };

    let options = parse_options(&req.params);
    let run = match run_pipeline(conn, &state.aliases, &artifact_path, &options) {
        Ok(v) => v,
        Err(abort) => {
            let _ = std::fs::remove_file(&artifact_path);
            return err(&req.id, abort.code, abort.message, None);
        }
    };

    let digest = sha256_hex(&bytes);
    state.contexts.put(ImportContext {
        token: token.clone(),
        artifact_path,
        digest,
        created_at: Utc::now(),
        options,
    });

    let message = format!(
        "{} rows: {} to insert, {} to update, {} skipped, {} with errors",
        run.totals.rows, run.totals.insert, run.totals.update, run.totals.skip, run.totals.error
    );
    ok(
        &req.id,
        json!({
            "token": token,
            "totals": run.totals,
            "rows": run.reports,
            "flash": flash(if run.totals.error == 0 { "info" } else { "warning" }, message),
        }),
    )
}

fn handle_commit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(token) = req.params.get("token").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.token", None);
    };
    let dry_run = req
        .params
        .get("dryRun")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let Some(ctx) = state.contexts.get(token, Utc::now()) else {
        return err(
            &req.id,
            "context_unknown",
            "unknown or expired import context; run preview again",
            None,
        );
    };

    // The token must still point at the exact bytes that were previewed.
    let bytes = match std::fs::read(&ctx.artifact_path) {
        Ok(b) => b,
        Err(_) => {
            state.contexts.remove(token);
            return err(
                &req.id,
                "context_unknown",
                "stored artifact is gone; run preview again",
                None,
            );
        }
    };
    if sha256_hex(&bytes) != ctx.digest {
        state.contexts.remove(token);
        let _ = std::fs::remove_file(&ctx.artifact_path);
        return err(
            &req.id,
            "context_mismatch",
            "stored artifact changed since preview; run preview again",
            None,
        );
    }

    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let run = match run_pipeline(conn, &state.aliases, &ctx.artifact_path, &ctx.options) {
        Ok(v) => v,
        Err(abort) => return err(&req.id, abort.code, abort.message, None),
    };

    if run.totals.error > 0 {
        return err(
            &req.id,
            "has_errors",
            "fix invalid rows first",
            Some(json!({ "totals": run.totals, "rows": run.reports })),
        );
    }

    if dry_run {
        // Read-only: counts as they would land, context stays live.
        return ok(
            &req.id,
            json!({
                "dryRun": true,
                "inserted": run.totals.insert,
                "updated": run.totals.update,
                "totals": run.totals,
                "rows": run.reports,
                "flash": flash("info", format!(
                    "dry run: {} would be inserted, {} updated",
                    run.totals.insert, run.totals.update
                )),
            }),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let mut write_err: Option<anyhow::Error> = None;
    for row in &run.rows {
        let Some(w) = plan::to_write(row) else {
            continue;
        };
        if let Err(e) = crate::db::upsert_result(&tx, &w) {
            write_err = Some(e);
            break;
        }
    }
    if let Some(e) = write_err {
        let _ = tx.rollback();
        let correlation = Uuid::new_v4().to_string();
        tracing::error!(correlation = %correlation, error = ?e, "otm import batch failed");
        return err(
            &req.id,
            "tx_failed",
            "import failed; nothing was written",
            Some(json!({ "correlationId": correlation })),
        );
    }
    if let Err(e) = tx.commit() {
        let correlation = Uuid::new_v4().to_string();
        tracing::error!(correlation = %correlation, error = ?e, "otm import commit failed");
        return err(
            &req.id,
            "tx_failed",
            "import failed; nothing was written",
            Some(json!({ "correlationId": correlation })),
        );
    }

    // Context is consumed by a successful commit, artifact included.
    state.contexts.remove(token);
    let _ = std::fs::remove_file(&ctx.artifact_path);
    if let Some(scope) = &ctx.options.scope {
        state.drafts.clear_scope(scope);
    }

    tracing::info!(
        inserted = run.totals.insert,
        updated = run.totals.update,
        "otm import committed"
    );
    ok(
        &req.id,
        json!({
            "inserted": run.totals.insert,
            "updated": run.totals.update,
            "totals": run.totals,
            "rows": run.reports,
            "flash": flash("success", format!(
                "saved {} results ({} inserted, {} updated)",
                run.totals.insert + run.totals.update,
                run.totals.insert,
                run.totals.update
            )),
        }),
    )
}

fn handle_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(token) = req.params.get("token").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.token", None);
    };
    if let Some(ctx) = state.contexts.remove(token) {
        let _ = std::fs::remove_file(&ctx.artifact_path);
    }
    ok(&req.id, json!({ "ok": true }))
}

/// Periodic housekeeping: evict expired contexts/drafts and reclaim artifact
/// files past the secondary TTL whether or not their token is still around.
fn handle_sweep(state: &mut AppState, req: &Request) -> serde_json::Value {
    let now = Utc::now();
    let evicted_contexts = state.contexts.evict_expired(now);
    let evicted_drafts = state.drafts.evict_expired(now);

    let mut removed_artifacts = 0usize;
    if let Some(uploads) = state.uploads_dir() {
        if let Ok(entries) = std::fs::read_dir(&uploads) {
            for ent in entries.flatten() {
                let p = ent.path();
                if !p.is_file() {
                    continue;
                }
                let age_ok = ent
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .map(|age| age.as_secs() as i64 > ARTIFACT_TTL_SECS)
                    .unwrap_or(false);
                if age_ok && std::fs::remove_file(&p).is_ok() {
                    removed_artifacts += 1;
                }
            }
        }
    }

    ok(
        &req.id,
        json!({
            "removedArtifacts": removed_artifacts,
            "evictedContexts": evicted_contexts,
            "evictedDrafts": evicted_drafts,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "otm.preview" => Some(handle_preview(state, req)),
        "otm.commit" => Some(handle_commit(state, req)),
        "otm.reset" => Some(handle_reset(state, req)),
        "imports.sweep" => Some(handle_sweep(state, req)),
        _ => None,
    }
}
