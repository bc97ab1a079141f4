use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::draft::{MemoryContextStore, MemoryDraftStore};
use crate::tabular::HeaderMap;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub contexts: MemoryContextStore,
    pub drafts: MemoryDraftStore,
    pub aliases: HeaderMap,
}

impl AppState {
    pub fn new(aliases: HeaderMap) -> AppState {
        AppState {
            workspace: None,
            db: None,
            contexts: MemoryContextStore::default(),
            drafts: MemoryDraftStore::default(),
            aliases,
        }
    }

    pub fn uploads_dir(&self) -> Option<PathBuf> {
        self.workspace.as_ref().map(|w| w.join("uploads"))
    }
}
