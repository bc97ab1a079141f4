use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::rowcheck::FieldError;

/// How long a preview token stays valid for a commit.
pub const CONTEXT_TTL_SECS: i64 = 30 * 60;
/// Orphaned artifact files are reclaimed after this, token or no token.
pub const ARTIFACT_TTL_SECS: i64 = 24 * 60 * 60;

fn expired(created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    (now - created_at).num_seconds() > CONTEXT_TTL_SECS
}

#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub has_header: bool,
    pub default_exam_id: Option<i64>,
    pub scope: Option<String>,
}

/// The remembered upload between "preview" and "commit". The digest pins the
/// commit to the exact bytes that were previewed.
#[derive(Debug, Clone)]
pub struct ImportContext {
    pub token: String,
    pub artifact_path: PathBuf,
    pub digest: String,
    pub created_at: DateTime<Utc>,
    pub options: ImportOptions,
}

/// Token -> context store. Injectable so the in-memory map can be swapped for
/// Redis or a table without touching pipeline logic.
pub trait ContextStore {
    fn put(&mut self, ctx: ImportContext);
    /// Live (unexpired) context for a token; expired entries are evicted here.
    fn get(&mut self, token: &str, now: DateTime<Utc>) -> Option<ImportContext>;
    fn remove(&mut self, token: &str) -> Option<ImportContext>;
    fn evict_expired(&mut self, now: DateTime<Utc>) -> usize;
}

#[derive(Default)]
pub struct MemoryContextStore {
    contexts: HashMap<String, ImportContext>,
}

impl ContextStore for MemoryContextStore {
    fn put(&mut self, ctx: ImportContext) {
        self.contexts.insert(ctx.token.clone(), ctx);
    }

    fn get(&mut self, token: &str, now: DateTime<Utc>) -> Option<ImportContext> {
        let stale = match self.contexts.get(token) {
            Some(ctx) => expired(ctx.created_at, now),
            None => return None,
        };
        if stale {
            self.contexts.remove(token);
            return None;
        }
        self.contexts.get(token).cloned()
    }

    fn remove(&mut self, token: &str) -> Option<ImportContext> {
        self.contexts.remove(token)
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.contexts.len();
        self.contexts
            .retain(|_, ctx| !expired(ctx.created_at, now));
        before - self.contexts.len()
    }
}

/// Exactly what the operator was looking at when the submit failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DraftKey {
    pub scope: String,
    pub exam: String,
    pub search: String,
}

/// One pupil's failed submission: the raw values as typed plus the errors
/// that blocked them.
#[derive(Debug, Clone, Serialize)]
pub struct DraftRow {
    pub values: HashMap<String, String>,
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone)]
pub struct DraftEntry {
    pub created_at: DateTime<Utc>,
    pub rows: HashMap<i64, DraftRow>,
}

/// Per-view draft state. Read-once: rendering the same view consumes the
/// entry, so stale corrections never leak into unrelated screens.
pub trait DraftStore {
    fn put(&mut self, key: DraftKey, rows: HashMap<i64, DraftRow>, now: DateTime<Utc>);
    fn take(&mut self, key: &DraftKey, now: DateTime<Utc>) -> Option<DraftEntry>;
    fn clear(&mut self, key: &DraftKey);
    /// Drop every draft belonging to a scope (used after a successful commit).
    fn clear_scope(&mut self, scope: &str);
    fn evict_expired(&mut self, now: DateTime<Utc>) -> usize;
}

#[derive(Default)]
pub struct MemoryDraftStore {
    drafts: HashMap<DraftKey, DraftEntry>,
}

impl DraftStore for MemoryDraftStore {
    fn put(&mut self, key: DraftKey, rows: HashMap<i64, DraftRow>, now: DateTime<Utc>) {
        self.drafts.insert(
            key,
            DraftEntry {
                created_at: now,
                rows,
            },
        );
    }

    fn take(&mut self, key: &DraftKey, now: DateTime<Utc>) -> Option<DraftEntry> {
        let entry = self.drafts.remove(key)?;
        if expired(entry.created_at, now) {
            return None;
        }
        Some(entry)
    }

    fn clear(&mut self, key: &DraftKey) {
        self.drafts.remove(key);
    }

    fn clear_scope(&mut self, scope: &str) {
        self.drafts.retain(|k, _| k.scope != scope);
    }

    fn evict_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.drafts.len();
        self.drafts
            .retain(|_, e| !expired(e.created_at, now));
        before - self.drafts.len()
    }
}
