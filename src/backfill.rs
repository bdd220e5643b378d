use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use serde_json::Value;

use crate::model::{COMMENTS, POSTS};
use crate::store::{Cursor, DocumentStore, Fields, Query, StoreError, WriteBatch, MAX_BATCH_WRITES};

pub const DEFAULT_CHUNK_SIZE: usize = 400;

/// Profile field whose copies on posts and comments get rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileField {
    Nickname,
    Avatar,
}

impl ProfileField {
    pub fn profile_field(self) -> &'static str {
        match self {
            ProfileField::Nickname => "nickname",
            ProfileField::Avatar => "profileImageURL",
        }
    }

    pub fn post_field(self) -> &'static str {
        self.profile_field()
    }

    pub fn comment_field(self) -> &'static str {
        match self {
            ProfileField::Nickname => "userNickname",
            ProfileField::Avatar => "userPhotoURL",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionReport {
    pub updated: usize,
    pub batches: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub posts: CollectionReport,
    pub comments: CollectionReport,
}

impl BackfillReport {
    pub fn is_complete(&self) -> bool {
        self.posts.error.is_none() && self.comments.error.is_none()
    }
}

/// Rewrites a user's denormalized display field across posts and comments.
///
/// Documents are walked in id order, one batch per chunk. A failure stops
/// that collection only; whatever was committed before it stays committed.
pub struct Backfill {
    store: Arc<dyn DocumentStore>,
    chunk_size: usize,
}

impl Backfill {
    pub fn new(store: Arc<dyn DocumentStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.clamp(1, MAX_BATCH_WRITES),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn run(&self, field: ProfileField, value: &str, user_id: &str) -> BackfillReport {
        BackfillReport {
            posts: self.backfill_collection(POSTS, field.post_field(), value, user_id),
            comments: self.backfill_collection(COMMENTS, field.comment_field(), value, user_id),
        }
    }

    /// Runs on a background thread so the caller can report the profile
    /// change right away.
    pub fn spawn(
        self: &Arc<Self>,
        field: ProfileField,
        value: String,
        user_id: String,
    ) -> thread::JoinHandle<BackfillReport> {
        let backfill = Arc::clone(self);
        thread::spawn(move || backfill.run(field, &value, &user_id))
    }

    fn backfill_collection(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        user_id: &str,
    ) -> CollectionReport {
        let mut report = CollectionReport::default();
        if let Err(err) = self.walk(collection, field, value, user_id, &mut report) {
            warn!(
                "backfill: {collection}.{field} for {user_id} stopped after {} documents: {err}",
                report.updated
            );
            report.error = Some(err.to_string());
        }
        report
    }

    fn walk(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        user_id: &str,
        report: &mut CollectionReport,
    ) -> Result<(), StoreError> {
        let base = Query::collection(collection)
            .where_eq("userId", user_id)
            .order_by_id()
            .limit(self.chunk_size);
        let mut cursor: Option<Cursor> = None;

        loop {
            let query = match cursor.take() {
                Some(cursor) => base.clone().start_after(cursor),
                None => base.clone(),
            };
            let docs = self.store.query(&query)?;
            if docs.is_empty() {
                return Ok(());
            }

            let mut batch = WriteBatch::new();
            for doc in &docs {
                let mut fields = Fields::new();
                fields.insert(field.to_string(), Value::String(value.to_string()));
                batch.update(collection, &doc.id, fields);
            }
            self.store.commit(batch)?;
            report.batches += 1;
            report.updated += docs.len();
            debug!(
                "backfill: {collection}.{field} for {user_id}: {} documents so far",
                report.updated
            );

            if docs.len() < self.chunk_size {
                return Ok(());
            }
            cursor = docs.last().map(|doc| query.cursor_after(doc));
        }
    }
}
