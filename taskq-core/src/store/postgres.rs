//! The production store backend: one table per collection, documents in a
//! `JSONB` column, conditional updates as single `UPDATE ... FROM (SELECT ...
//! FOR UPDATE SKIP LOCKED)` statements, and scoped transactions mapped onto
//! postgres transactions.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::{QueryBuilder, Row, Transaction};

use crate::document::Document;
use crate::error::{Error, Result};
use crate::filter::Filter;
use crate::store::{
    Collection, FindOptions, Patch, RecordStore, ReturnDocument, SortOrder, StoreSession,
};

const QUEUE_NAME_INDEX: &str = "taskq_queues_name_idx";
const EVENT_SEQUENCE_INDEX: &str = "taskq_events_queue_seq_idx";

/// Fields the engine sorts on; all serialized as numbers in the document
/// form, so they get a numeric cast in ORDER BY.
const NUMERIC_FIELDS: &[&str] = &[
    "priority",
    "created_at",
    "last_modified",
    "last_heartbeat",
    "start_time",
    "sequence",
    "timestamp",
    "retries",
    "max_retries",
];

fn table(collection: Collection) -> &'static str {
    match collection {
        Collection::Queues => "taskq_queues",
        Collection::Tasks => "taskq_tasks",
        Collection::Workers => "taskq_workers",
        Collection::Events => "taskq_events",
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect lazily and make sure the schema exists.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| Error::StoreFatal(format!("connection failed with: {error}")))?;
        let store = Self { pool };
        store.prepare().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and the indexes backing dispatch, the reaper scans and
    /// the journal's uniqueness guarantee.
    pub async fn prepare(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS taskq_queues (id TEXT PRIMARY KEY, doc JSONB NOT NULL)",
            "CREATE TABLE IF NOT EXISTS taskq_tasks (id TEXT PRIMARY KEY, doc JSONB NOT NULL)",
            "CREATE TABLE IF NOT EXISTS taskq_workers (id TEXT PRIMARY KEY, doc JSONB NOT NULL)",
            "CREATE TABLE IF NOT EXISTS taskq_events (id TEXT PRIMARY KEY, doc JSONB NOT NULL)",
            "CREATE UNIQUE INDEX IF NOT EXISTS taskq_queues_name_idx \
             ON taskq_queues ((doc->>'queue_name'))",
            "CREATE INDEX IF NOT EXISTS taskq_tasks_dispatch_idx \
             ON taskq_tasks ((doc->>'queue_id'), (doc->>'status'), \
                 ((doc->>'priority')::bigint) DESC, ((doc->>'created_at')::bigint) ASC)",
            "CREATE INDEX IF NOT EXISTS taskq_tasks_heartbeat_idx \
             ON taskq_tasks ((doc->>'queue_id'), ((doc->>'last_heartbeat')::bigint))",
            "CREATE INDEX IF NOT EXISTS taskq_tasks_start_time_idx \
             ON taskq_tasks ((doc->>'queue_id'), ((doc->>'start_time')::bigint))",
            "CREATE INDEX IF NOT EXISTS taskq_tasks_worker_idx \
             ON taskq_tasks ((doc->>'queue_id'), (doc->>'worker_id'))",
            "CREATE INDEX IF NOT EXISTS taskq_workers_status_idx \
             ON taskq_workers ((doc->>'queue_id'), (doc->>'status'))",
            "CREATE INDEX IF NOT EXISTS taskq_workers_name_idx \
             ON taskq_workers ((doc->>'queue_id'), (doc->>'worker_name'))",
            "CREATE UNIQUE INDEX IF NOT EXISTS taskq_events_queue_seq_idx \
             ON taskq_events ((doc->>'queue_id'), ((doc->>'sequence')::bigint))",
            "CREATE INDEX IF NOT EXISTS taskq_events_timestamp_idx \
             ON taskq_events ((doc->>'queue_id'), ((doc->>'timestamp')::bigint))",
        ];
        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|error| map_sqlx("DDL", error))?;
        }
        Ok(())
    }
}

/// Wrap an sqlx error, classifying unique-index conflicts and transient
/// connection problems.
fn map_sqlx(command: &str, error: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &error {
        match db.constraint() {
            Some(QUEUE_NAME_INDEX) => return Error::Conflict("queue_name already exists".into()),
            Some(EVENT_SEQUENCE_INDEX) => {
                return Error::StoreTransient("duplicate event sequence for queue".into())
            }
            Some(other) => return Error::Conflict(format!("unique index violation: {other}")),
            None => {}
        }
    }
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            Error::StoreTransient(format!("{command} query failed with: {error}"))
        }
        other => Error::StoreFatal(format!("{command} query failed with: {other}")),
    }
}

fn path_segments(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

/// Push `doc #> '{...}'` with the path bound as a text[] parameter, so user
/// filter keys never reach the SQL text.
fn push_path(qb: &mut QueryBuilder<'_, Postgres>, path: &str) {
    qb.push("doc #> ");
    qb.push_bind(path_segments(path));
}

fn push_path_text(qb: &mut QueryBuilder<'_, Postgres>, path: &str) {
    qb.push("doc #>> ");
    qb.push_bind(path_segments(path));
}

/// Translate a filter document into a WHERE fragment. The surface is the
/// same one `crate::filter::matches` evaluates in process.
fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) -> Result<()> {
    qb.push("TRUE");
    for (key, condition) in filter {
        qb.push(" AND ");
        match key.as_str() {
            "$and" | "$or" => push_clause_list(qb, key, condition)?,
            path => push_condition(qb, path, condition)?,
        }
    }
    Ok(())
}

fn push_clause_list(
    qb: &mut QueryBuilder<'_, Postgres>,
    op: &str,
    condition: &Value,
) -> Result<()> {
    let clauses = condition
        .as_array()
        .ok_or_else(|| Error::Validation(format!("{op} expects a list of filters")))?;
    let joiner = if op == "$and" { " AND " } else { " OR " };
    qb.push("(");
    for (i, clause) in clauses.iter().enumerate() {
        if i > 0 {
            qb.push(joiner);
        }
        let sub = clause
            .as_object()
            .ok_or_else(|| Error::Validation(format!("{op} expects a list of filters")))?;
        qb.push("(");
        push_filter(qb, sub)?;
        qb.push(")");
    }
    if clauses.is_empty() {
        qb.push("TRUE");
    }
    qb.push(")");
    Ok(())
}

fn push_condition(qb: &mut QueryBuilder<'_, Postgres>, path: &str, condition: &Value) -> Result<()> {
    match condition {
        Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
            let mut first = true;
            for (op, operand) in ops {
                if !first {
                    qb.push(" AND ");
                }
                first = false;
                push_operator(qb, path, op, operand)?;
            }
            Ok(())
        }
        literal => {
            push_path(qb, path);
            qb.push(" = ");
            qb.push_bind(sqlx::types::Json(literal.clone()));
            Ok(())
        }
    }
}

fn push_operator(
    qb: &mut QueryBuilder<'_, Postgres>,
    path: &str,
    op: &str,
    operand: &Value,
) -> Result<()> {
    match op {
        "$eq" => {
            push_path(qb, path);
            qb.push(" = ");
            qb.push_bind(sqlx::types::Json(operand.clone()));
        }
        "$ne" => {
            push_path(qb, path);
            qb.push(" IS DISTINCT FROM ");
            qb.push_bind(sqlx::types::Json(operand.clone()));
        }
        "$exists" => {
            push_path(qb, path);
            if operand.as_bool().unwrap_or(true) {
                qb.push(" IS NOT NULL");
            } else {
                qb.push(" IS NULL");
            }
        }
        "$in" | "$nin" => {
            if !operand.is_array() {
                return Err(Error::Validation(format!("{op} expects a list")));
            }
            if op == "$nin" {
                qb.push("NOT ");
            }
            qb.push("EXISTS (SELECT 1 FROM jsonb_array_elements(");
            qb.push_bind(sqlx::types::Json(operand.clone()));
            qb.push(") AS el(v) WHERE el.v = ");
            push_path(qb, path);
            qb.push(")");
        }
        "$gt" | "$gte" | "$lt" | "$lte" => {
            let cmp = match op {
                "$gt" => " > ",
                "$gte" => " >= ",
                "$lt" => " < ",
                _ => " <= ",
            };
            match operand {
                Value::Number(n) => {
                    qb.push("(");
                    push_path_text(qb, path);
                    qb.push(")::float8");
                    qb.push(cmp);
                    qb.push_bind(n.as_f64().unwrap_or(f64::NAN));
                }
                Value::String(s) => {
                    qb.push("(");
                    push_path_text(qb, path);
                    qb.push(")");
                    qb.push(cmp);
                    qb.push_bind(s.clone());
                }
                other => {
                    return Err(Error::Validation(format!(
                        "{op} expects a number or string, got {other}"
                    )))
                }
            }
        }
        unknown => {
            return Err(Error::Validation(format!(
                "unsupported filter operator {unknown:?}"
            )))
        }
    }
    Ok(())
}

fn push_sort(qb: &mut QueryBuilder<'_, Postgres>, sort: &[(String, SortOrder)]) {
    if sort.is_empty() {
        return;
    }
    qb.push(" ORDER BY ");
    for (i, (field, order)) in sort.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        if NUMERIC_FIELDS.contains(&field.as_str()) {
            qb.push("(");
            push_path_text(qb, field);
            qb.push(")::float8");
        } else {
            push_path_text(qb, field);
        }
        qb.push(match order {
            SortOrder::Asc => " ASC",
            SortOrder::Desc => " DESC",
        });
    }
}

fn doc_from_row(row: &sqlx::postgres::PgRow) -> Result<Document> {
    let value: Value = row
        .try_get("doc")
        .map_err(|error| Error::StoreFatal(format!("invalid doc column: {error}")))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::StoreFatal(format!(
            "expected a JSON object in doc column, got {other}"
        ))),
    }
}

async fn find_many_with<'c, E>(
    executor: E,
    collection: Collection,
    filter: &Filter,
    options: &FindOptions,
) -> Result<Vec<Document>>
where
    E: sqlx::PgExecutor<'c>,
{
    let mut qb = QueryBuilder::new(format!("SELECT doc FROM {} WHERE ", table(collection)));
    push_filter(&mut qb, filter)?;
    push_sort(&mut qb, &options.sort);
    if let Some(limit) = options.limit {
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);
    }
    if options.offset > 0 {
        qb.push(" OFFSET ");
        qb.push_bind(options.offset as i64);
    }
    let rows = qb
        .build()
        .fetch_all(executor)
        .await
        .map_err(|error| map_sqlx("SELECT", error))?;
    rows.iter().map(doc_from_row).collect()
}

async fn find_one_with<'c, E>(
    executor: E,
    collection: Collection,
    filter: &Filter,
) -> Result<Option<Document>>
where
    E: sqlx::PgExecutor<'c>,
{
    let docs = find_many_with(executor, collection, filter, &FindOptions::limit(1)).await?;
    Ok(docs.into_iter().next())
}

async fn insert_with<'c, E>(executor: E, collection: Collection, doc: Document) -> Result<()>
where
    E: sqlx::PgExecutor<'c>,
{
    let id = doc
        .get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::StoreFatal("document is missing a string _id".into()))?
        .to_owned();
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {} (id, doc) VALUES (",
        table(collection)
    ));
    qb.push_bind(id);
    qb.push(", ");
    qb.push_bind(sqlx::types::Json(Value::Object(doc)));
    qb.push(")");
    qb.build()
        .execute(executor)
        .await
        .map_err(|error| map_sqlx("INSERT", error))?;
    Ok(())
}

/// The single-statement conditional update. The SKIP LOCKED target selection
/// keeps concurrent claimants from blocking on each other, exactly like a
/// queue dequeue.
async fn update_returning_with<'c, E>(
    executor: E,
    collection: Collection,
    filter: &Filter,
    patch: &Patch,
) -> Result<Option<(Document, Document)>>
where
    E: sqlx::PgExecutor<'c>,
{
    let t = table(collection);
    let mut qb = QueryBuilder::new(format!(
        "WITH target AS (SELECT id, doc FROM {t} WHERE "
    ));
    push_filter(&mut qb, filter)?;
    qb.push(format!(
        " LIMIT 1 FOR UPDATE SKIP LOCKED) \
         UPDATE {t} SET doc = ({t}.doc || "
    ));
    qb.push_bind(sqlx::types::Json(Value::Object(patch.set.clone())));
    qb.push(") - ");
    qb.push_bind(patch.unset.clone());
    qb.push(format!(
        "::text[] FROM target WHERE {t}.id = target.id \
         RETURNING target.doc AS before_doc, {t}.doc AS after_doc"
    ));
    let row = qb
        .build()
        .fetch_optional(executor)
        .await
        .map_err(|error| map_sqlx("UPDATE", error))?;
    match row {
        None => Ok(None),
        Some(row) => {
            let before: Value = row
                .try_get("before_doc")
                .map_err(|error| Error::StoreFatal(format!("invalid doc column: {error}")))?;
            let after: Value = row
                .try_get("after_doc")
                .map_err(|error| Error::StoreFatal(format!("invalid doc column: {error}")))?;
            match (before, after) {
                (Value::Object(b), Value::Object(a)) => Ok(Some((b, a))),
                _ => Err(Error::StoreFatal("expected JSON objects in doc columns".into())),
            }
        }
    }
}

async fn delete_many_with<'c, E>(executor: E, collection: Collection, filter: &Filter) -> Result<u64>
where
    E: sqlx::PgExecutor<'c>,
{
    let mut qb = QueryBuilder::new(format!("DELETE FROM {} WHERE ", table(collection)));
    push_filter(&mut qb, filter)?;
    let done = qb
        .build()
        .execute(executor)
        .await
        .map_err(|error| map_sqlx("DELETE", error))?;
    Ok(done.rows_affected())
}

#[async_trait]
impl RecordStore for PgStore {
    type Session = PgSession;

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|error| map_sqlx("SELECT", error))?;
        Ok(())
    }

    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>> {
        find_one_with(&self.pool, collection, filter).await
    }

    async fn find_many(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        find_many_with(&self.pool, collection, filter, options).await
    }

    async fn insert(&self, collection: Collection, doc: Document) -> Result<()> {
        insert_with(&self.pool, collection, doc).await
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64> {
        Ok(update_returning_with(&self.pool, collection, filter, patch)
            .await?
            .map_or(0, |_| 1))
    }

    async fn find_one_and_update(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
        ret: ReturnDocument,
    ) -> Result<Option<Document>> {
        let images = update_returning_with(&self.pool, collection, filter, patch).await?;
        Ok(images.map(|(before, after)| match ret {
            ReturnDocument::Before => before,
            ReturnDocument::After => after,
        }))
    }

    async fn delete_many(&self, collection: Collection, filter: &Filter) -> Result<u64> {
        delete_many_with(&self.pool, collection, filter).await
    }

    async fn begin(&self, _queue_id: &str) -> Result<Self::Session> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|error| map_sqlx("BEGIN", error))?;
        Ok(PgSession { tx })
    }
}

/// A postgres transaction. Rolls back on drop unless committed.
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl StoreSession for PgSession {
    async fn find_one(
        &mut self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>> {
        find_one_with(&mut *self.tx, collection, filter).await
    }

    async fn find_many(
        &mut self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        find_many_with(&mut *self.tx, collection, filter, options).await
    }

    async fn insert(&mut self, collection: Collection, doc: Document) -> Result<()> {
        insert_with(&mut *self.tx, collection, doc).await
    }

    async fn update_one(
        &mut self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64> {
        Ok(
            update_returning_with(&mut *self.tx, collection, filter, patch)
                .await?
                .map_or(0, |_| 1),
        )
    }

    async fn find_one_and_update(
        &mut self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
        ret: ReturnDocument,
    ) -> Result<Option<Document>> {
        let images = update_returning_with(&mut *self.tx, collection, filter, patch).await?;
        Ok(images.map(|(before, after)| match ret {
            ReturnDocument::Before => before,
            ReturnDocument::After => after,
        }))
    }

    async fn delete_many(&mut self, collection: Collection, filter: &Filter) -> Result<u64> {
        delete_many_with(&mut *self.tx, collection, filter).await
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|error| map_sqlx("COMMIT", error))
    }
}
