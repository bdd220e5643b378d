//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::format;
use crate::model::{COMMENTS, POSTS};
use crate::store::{
    Document, DocumentStore, Fields, Query, SqliteStore, StoreError, WriteBatch,
};

type QueryHook = Box<dyn FnOnce() + Send>;

/// In-memory store that counts batch commits and can be told to fail.
pub struct ScriptedStore {
    inner: SqliteStore,
    commits: AtomicUsize,
    fail_commit: Option<usize>,
    fail_queries: AtomicBool,
    query_hook: Mutex<Option<QueryHook>>,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    /// Fails the `n`th commit (1-based); every other commit goes through.
    pub fn failing_commit(n: usize) -> Arc<Self> {
        Self::build(Some(n))
    }

    fn build(fail_commit: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            commits: AtomicUsize::new(0),
            fail_commit,
            fail_queries: AtomicBool::new(false),
            query_hook: Mutex::new(None),
        })
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn set_queries_failing(&self, failing: bool) {
        self.fail_queries.store(failing, Ordering::SeqCst);
    }

    /// Runs `hook` once, at the start of the next `query` call, before the
    /// query reads anything.
    pub fn before_next_query(&self, hook: impl FnOnce() + Send + 'static) {
        *self.query_hook.lock() = Some(Box::new(hook));
    }

    fn check_queries(&self) -> Result<(), StoreError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("scripted query failure".into()));
        }
        Ok(())
    }
}

impl DocumentStore for ScriptedStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        self.inner.get(collection, id)
    }

    fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, StoreError> {
        self.check_queries()?;
        self.inner.get_many(collection, ids)
    }

    fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let hook = self.query_hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.check_queries()?;
        self.inner.query(query)
    }

    fn add(&self, collection: &str, fields: Fields) -> Result<String, StoreError> {
        self.inner.add(collection, fields)
    }

    fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError> {
        self.inner.set(collection, id, fields)
    }

    fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError> {
        self.inner.update(collection, id, fields)
    }

    fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.inner.delete(collection, id)
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let n = self.commits.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_commit == Some(n) {
            return Err(StoreError::Unavailable(format!("scripted failure of commit {n}")));
        }
        self.inner.commit(batch)
    }
}

pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(fields) => fields,
        _ => panic!("expected object"),
    }
}

/// Creation time of the `n`th seeded document; later `n` is newer.
pub fn seeded_at(n: usize) -> String {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    format::timestamp_value(base + Duration::minutes(n as i64))
}

pub fn seed_post(store: &dyn DocumentStore, id: &str, user_id: &str, n: usize) {
    store
        .set(
            POSTS,
            id,
            fields(json!({
                "userId": user_id,
                "title": format!("post {n}"),
                "content": "body",
                "images": [],
                "comments": [],
                "createdAt": seeded_at(n),
                "nickname": "before",
            })),
        )
        .unwrap();
}

pub fn seed_comment(store: &dyn DocumentStore, id: &str, post_id: &str, user_id: &str, n: usize) {
    store
        .set(
            COMMENTS,
            id,
            fields(json!({
                "postId": post_id,
                "userId": user_id,
                "comment": format!("comment {n}"),
                "createdAt": seeded_at(n),
                "userNickname": "before",
            })),
        )
        .unwrap();
}
