use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rand::distributions::{Alphanumeric, DistString};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::format::parse_timestamp;

/// Raw document body as the backend stores it.
pub type Fields = Map<String, Value>;

/// Largest number of writes a single [`WriteBatch`] may carry.
pub const MAX_BATCH_WRITES: usize = 500;

/// Largest number of ids a single [`DocumentStore::get_many`] call accepts.
pub const MAX_LOOKUP_IDS: usize = 10;

const GENERATED_ID_LEN: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },
    #[error("batch of {0} writes exceeds the limit of {MAX_BATCH_WRITES}")]
    BatchTooLarge(usize),
    #[error("lookup of {0} ids exceeds the limit of {MAX_LOOKUP_IDS}")]
    TooManyIds(usize),
    #[error("invalid field name {0:?}")]
    InvalidField(String),
    #[error("cursor was taken from a query with a different ordering")]
    CursorMismatch,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("document body is not an object")]
    NotAnObject,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn sql(self) -> &'static str {
        match self {
            Direction::Ascending => "ASC",
            Direction::Descending => "DESC",
        }
    }

    fn after_op(self) -> &'static str {
        match self {
            Direction::Ascending => ">",
            Direction::Descending => "<",
        }
    }
}

/// Result ordering. Field orderings break ties by document id in the same
/// direction, so every ordering is total. Timestamp values compare by the
/// instant they name, whichever stored shape they use.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderBy {
    DocumentId,
    Field { name: String, direction: Direction },
}

/// Continuation point: the last document of the previous page.
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    order: OrderBy,
    key: Option<Value>,
    id: String,
}

impl Cursor {
    pub fn document_id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<(String, Value)>,
    pub order: OrderBy,
    pub start_after: Option<Cursor>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(name: &str) -> Self {
        Self {
            collection: name.to_string(),
            filters: Vec::new(),
            order: OrderBy::DocumentId,
            start_after: None,
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push((field.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order = OrderBy::Field {
            name: field.to_string(),
            direction,
        };
        self
    }

    pub fn order_by_id(mut self) -> Self {
        self.order = OrderBy::DocumentId;
        self
    }

    pub fn start_after(mut self, cursor: Cursor) -> Self {
        self.start_after = Some(cursor);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Cursor that continues this query after `doc`.
    pub fn cursor_after(&self, doc: &Document) -> Cursor {
        let key = match &self.order {
            OrderBy::DocumentId => None,
            OrderBy::Field { name, .. } => doc.get(name).cloned(),
        };
        Cursor {
            order: self.order.clone(),
            key,
            id: doc.id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Merge `fields` into the document, creating it if absent.
    Set {
        collection: String,
        id: String,
        fields: Fields,
    },
    /// Merge `fields` into an existing document.
    Update {
        collection: String,
        id: String,
        fields: Fields,
    },
    Delete {
        collection: String,
        id: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, collection: &str, id: &str, fields: Fields) -> &mut Self {
        self.writes.push(Write::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        });
        self
    }

    pub fn update(&mut self, collection: &str, id: &str, fields: Fields) -> &mut Self {
        self.writes.push(Write::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            fields,
        });
        self
    }

    pub fn delete(&mut self, collection: &str, id: &str) -> &mut Self {
        self.writes.push(Write::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn writes(&self) -> &[Write] {
        &self.writes
    }
}

/// Document database the board runs on.
///
/// Documents without the ordering field are left out of ordered queries.
/// `commit` is all-or-nothing.
pub trait DocumentStore: Send + Sync {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;
    fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, StoreError>;
    fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;
    fn add(&self, collection: &str, fields: Fields) -> Result<String, StoreError>;
    fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError>;
    fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError>;
    fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;
    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError>;
}

/// Serializes a record into a document body.
pub fn fields_of<T: Serialize>(value: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(value)? {
        Value::Object(fields) => Ok(fields),
        _ => Err(StoreError::NotAnObject),
    }
}

#[derive(Debug, Default, Clone)]
pub struct Options {
    pub path: Option<PathBuf>,
}

/// SQLite-backed [`DocumentStore`]; bodies are kept as JSON text.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(opts: Options) -> Result<Self> {
        let path = if let Some(path) = opts.path {
            path
        } else {
            default_path().context("store: resolve default path")?
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("store: create directory {}", parent.display()))?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("store: open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", &"WAL")
            .context("store: set WAL")?;
        conn.pragma_update(None, "busy_timeout", &5000)
            .context("store: set busy timeout")?;
        prepare(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("store: open in-memory database")?;
        prepare(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = Arc::try_unwrap(self.conn)
            .map_err(|_| anyhow!("store: connection still in use"))?
            .into_inner();
        conn.close()
            .map_err(|(_, err)| err)
            .context("store: close connection")
    }
}

impl DocumentStore for SqliteStore {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let conn = self.conn.lock();
        Ok(read_fields(&conn, collection, id)?.map(|fields| Document {
            id: id.to_string(),
            fields,
        }))
    }

    fn get_many(&self, collection: &str, ids: &[String]) -> Result<Vec<Document>, StoreError> {
        if ids.len() > MAX_LOOKUP_IDS {
            return Err(StoreError::TooManyIds(ids.len()));
        }
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(",");
        let mut args = vec![SqlValue::Text(collection.to_string())];
        args.extend(ids.iter().map(|id| SqlValue::Text(id.clone())));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, data FROM documents WHERE collection = ?1 AND id IN ({}) ORDER BY id",
            placeholders
        ))?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        documents_from_rows(rows)
    }

    fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut sql = String::from("SELECT id, data FROM documents WHERE collection = ?");
        let mut args = vec![SqlValue::Text(query.collection.clone())];

        for (field, value) in &query.filters {
            sql.push_str(" AND json_extract(data, ?) = ?");
            args.push(SqlValue::Text(json_path(field)?));
            args.push(sql_value(value));
        }

        if let Some(cursor) = &query.start_after {
            if cursor.order != query.order {
                return Err(StoreError::CursorMismatch);
            }
        }

        match &query.order {
            OrderBy::DocumentId => {
                if let Some(cursor) = &query.start_after {
                    sql.push_str(" AND id > ?");
                    args.push(SqlValue::Text(cursor.id.clone()));
                }
                sql.push_str(" ORDER BY id ASC");
            }
            OrderBy::Field { name, direction } => {
                let path = SqlValue::Text(json_path(name)?);
                sql.push_str(" AND json_extract(data, ?) IS NOT NULL");
                args.push(path.clone());
                if let Some(cursor) = &query.start_after {
                    let key = cursor.key.as_ref().map(sql_value).unwrap_or(SqlValue::Null);
                    let op = direction.after_op();
                    sql.push_str(&format!(
                        " AND (order_key(json_extract(data, ?)) {op} order_key(?) \
                         OR (order_key(json_extract(data, ?)) = order_key(?) AND id {op} ?))"
                    ));
                    args.extend([
                        path.clone(),
                        key.clone(),
                        path.clone(),
                        key,
                        SqlValue::Text(cursor.id.clone()),
                    ]);
                }
                let dir = direction.sql();
                sql.push_str(&format!(
                    " ORDER BY order_key(json_extract(data, ?)) {dir}, id {dir}"
                ));
                args.push(path);
            }
        }

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            args.push(SqlValue::Integer(limit as i64));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        documents_from_rows(rows)
    }

    fn add(&self, collection: &str, fields: Fields) -> Result<String, StoreError> {
        let id = Alphanumeric.sample_string(&mut rand::thread_rng(), GENERATED_ID_LEN);
        let conn = self.conn.lock();
        write_fields(&conn, collection, &id, &fields)?;
        Ok(id)
    }

    fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        apply(
            &conn,
            Write::Set {
                collection: collection.to_string(),
                id: id.to_string(),
                fields,
            },
        )
    }

    fn update(&self, collection: &str, id: &str, fields: Fields) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        apply(
            &conn,
            Write::Update {
                collection: collection.to_string(),
                id: id.to_string(),
                fields,
            },
        )
    }

    fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        apply(
            &conn,
            Write::Delete {
                collection: collection.to_string(),
                id: id.to_string(),
            },
        )
    }

    fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.len() > MAX_BATCH_WRITES {
            return Err(StoreError::BatchTooLarge(batch.len()));
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for write in batch.writes {
            apply(&tx, write)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn apply(conn: &Connection, write: Write) -> Result<(), StoreError> {
    match write {
        Write::Set {
            collection,
            id,
            fields,
        } => {
            let mut merged = read_fields(conn, &collection, &id)?.unwrap_or_default();
            merged.extend(fields);
            write_fields(conn, &collection, &id, &merged)
        }
        Write::Update {
            collection,
            id,
            fields,
        } => {
            let Some(mut merged) = read_fields(conn, &collection, &id)? else {
                return Err(StoreError::NotFound { collection, id });
            };
            merged.extend(fields);
            write_fields(conn, &collection, &id, &merged)
        }
        Write::Delete { collection, id } => {
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )?;
            Ok(())
        }
    }
}

fn read_fields(conn: &Connection, collection: &str, id: &str) -> Result<Option<Fields>, StoreError> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
            params![collection, id],
            |row| row.get(0),
        )
        .optional()?;
    match data {
        Some(data) => Ok(Some(serde_json::from_str(&data)?)),
        None => Ok(None),
    }
}

fn write_fields(
    conn: &Connection,
    collection: &str,
    id: &str,
    fields: &Fields,
) -> Result<(), StoreError> {
    let data = serde_json::to_string(fields)?;
    conn.execute(
        r#"
INSERT INTO documents (collection, id, data)
VALUES (?1, ?2, ?3)
ON CONFLICT(collection, id) DO UPDATE SET data = excluded.data
"#,
        params![collection, id, data],
    )?;
    Ok(())
}

fn documents_from_rows(rows: Vec<(String, String)>) -> Result<Vec<Document>, StoreError> {
    rows.into_iter()
        .map(|(id, data)| {
            Ok(Document {
                id,
                fields: serde_json::from_str(&data)?,
            })
        })
        .collect()
}

fn json_path(field: &str) -> Result<String, StoreError> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StoreError::InvalidField(field.to_string()));
    }
    Ok(format!("$.{field}"))
}

// Mirrors what json_extract hands back for each JSON type.
fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => match number.as_i64() {
            Some(int) => SqlValue::Integer(int),
            None => SqlValue::Real(number.as_f64().unwrap_or_default()),
        },
        Value::String(text) => SqlValue::Text(text.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn prepare(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "order_key",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| Ok(order_key(ctx.get_raw(0))),
    )
    .context("store: register order_key")?;
    migrate(conn)
}

// Timestamps in any stored shape become epoch milliseconds, so they sort
// against each other by instant. Other values pass through.
fn order_key(raw: ValueRef<'_>) -> SqlValue {
    match raw {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(secs) => SqlValue::Integer(secs.saturating_mul(1000)),
        ValueRef::Real(secs) => SqlValue::Real(secs * 1000.0),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes);
            let value = if text.starts_with('{') {
                serde_json::from_str(&text).unwrap_or(Value::Null)
            } else {
                Value::String(text.to_string())
            };
            match parse_timestamp(&value) {
                Some(ts) => SqlValue::Integer(ts.timestamp_millis()),
                None => SqlValue::Text(text.into_owned()),
            }
        }
        ValueRef::Blob(bytes) => SqlValue::Blob(bytes.to_vec()),
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at INTEGER NOT NULL
)
"#,
        [],
    )?;

    let current: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for (idx, sql) in migrations().iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
            params![
                version,
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::from_secs(0))
                    .as_secs() as i64,
            ],
        )?;
    }
    Ok(())
}

fn migrations() -> Vec<&'static str> {
    vec![
        r#"
CREATE TABLE IF NOT EXISTS documents (
  collection TEXT NOT NULL,
  id TEXT NOT NULL,
  data TEXT NOT NULL,
  PRIMARY KEY (collection, id)
);
"#,
    ]
}

pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("postboard").join("board.db"))
}
