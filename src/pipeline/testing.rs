//! Shared fixtures for unit tests: a migrated temp database and a scripted API

use super::client::{Api, ApiClient};
use super::db::Store;
use super::error::ScanError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tempfile::NamedTempFile;

pub const SCHEMA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/sql");

/// Create a migrated database in a temp file (keep the file alive with the store)
pub fn create_test_store() -> (NamedTempFile, Store) {
    let temp_file = NamedTempFile::new().unwrap();
    let store = Store::open(temp_file.path()).unwrap();
    store.migrate(SCHEMA_DIR).unwrap();
    (temp_file, store)
}

type Handler = Box<dyn Fn(&[(String, String)]) -> Result<Value, ScanError> + Send + Sync>;

/// In-memory `ApiClient`: routes (api, path) to closures and records every call
pub struct ScriptedClient {
    routes: HashMap<(Api, String), Handler>,
    calls: Mutex<Vec<(Api, String, Vec<(String, String)>)>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn route<F>(mut self, api: Api, path: &str, handler: F) -> Self
    where
        F: Fn(&[(String, String)]) -> Result<Value, ScanError> + Send + Sync + 'static,
    {
        self.routes.insert((api, path.to_string()), Box::new(handler));
        self
    }

    /// Calls made to `path`, with their query strings
    pub fn calls_to(&self, path: &str) -> Vec<Vec<(String, String)>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p, _)| p == path)
            .map(|(_, _, q)| q.clone())
            .collect()
    }
}

/// Value of `key` in a query, if present
pub fn param<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

#[async_trait]
impl ApiClient for ScriptedClient {
    async fn get_json(
        &self,
        api: Api,
        path: &str,
        query: &[(String, String)],
    ) -> Result<Value, ScanError> {
        self.calls
            .lock()
            .unwrap()
            .push((api, path.to_string(), query.to_vec()));

        match self.routes.get(&(api, path.to_string())) {
            Some(handler) => handler(query),
            None => Err(ScanError::Status {
                url: path.to_string(),
                status: 404,
            }),
        }
    }
}
