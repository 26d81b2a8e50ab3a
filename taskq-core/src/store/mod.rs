//! The record store adapter: document CRUD with conditional updates, indexed
//! queries, and per-queue scoped transactions over the four collections.
//!
//! Two backends implement the same trait surface: [`postgres::PgStore`] for
//! production, and [`memory::MemoryStore`] for tests and single-process dev
//! deployments. The engine is generic over the backend, so tests substitute
//! the store the same way they would any other collaborator.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;

use crate::document::Document;
use crate::error::Result;
use crate::filter::Filter;

/// The four logical collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Queues,
    Tasks,
    Workers,
    Events,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Queues => "queues",
            Collection::Tasks => "tasks",
            Collection::Workers => "workers",
            Collection::Events => "events",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Query shaping for `find_many`.
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    /// Ordered list of `(field, order)` pairs; earlier entries dominate.
    pub sort: Vec<(String, SortOrder)>,
}

impl FindOptions {
    pub fn limit(limit: usize) -> Self {
        FindOptions {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn sorted(sort: Vec<(String, SortOrder)>) -> Self {
        FindOptions {
            sort,
            ..Default::default()
        }
    }
}

/// A top-level field update: `set` overwrites fields, `unset` removes them.
/// The engine always computes full new field values before patching, so
/// nothing finer-grained is needed at the store layer.
#[derive(Debug, Clone, Default)]
pub struct Patch {
    pub set: Document,
    pub unset: Vec<String>,
}

impl Patch {
    pub fn new() -> Self {
        Patch::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.insert(field.to_string(), value.into());
        self
    }

    pub fn unset(mut self, field: &str) -> Self {
        self.unset.push(field.to_string());
        self
    }

    /// Apply this patch to a document in place.
    pub fn apply(&self, doc: &mut Document) {
        for (key, value) in &self.set {
            doc.insert(key.clone(), value.clone());
        }
        for key in &self.unset {
            doc.remove(key);
        }
    }
}

/// Which image `find_one_and_update` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnDocument {
    Before,
    After,
}

/// Abstract document store. All mutating operations are atomic conditional
/// updates; they are the linearization points of the engine.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    type Session: StoreSession;

    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> Result<()>;

    async fn find_one(&self, collection: Collection, filter: &Filter)
        -> Result<Option<Document>>;

    async fn find_many(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>>;

    async fn insert(&self, collection: Collection, doc: Document) -> Result<()>;

    /// Update the first matching document; returns the matched count (0 or 1).
    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64>;

    /// Atomically update the first matching document and return its image.
    async fn find_one_and_update(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
        ret: ReturnDocument,
    ) -> Result<Option<Document>>;

    async fn delete_many(&self, collection: Collection, filter: &Filter) -> Result<u64>;

    /// Begin a transaction scoped to one queue: read-your-write and
    /// all-or-nothing for any mix of tasks, workers and events under that
    /// queue. Dropping the session without committing rolls back.
    async fn begin(&self, queue_id: &str) -> Result<Self::Session>;
}

/// The operations available inside a scoped transaction.
#[async_trait]
pub trait StoreSession: Send {
    async fn find_one(
        &mut self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>>;

    async fn find_many(
        &mut self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>>;

    async fn insert(&mut self, collection: Collection, doc: Document) -> Result<()>;

    async fn update_one(
        &mut self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64>;

    async fn find_one_and_update(
        &mut self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
        ret: ReturnDocument,
    ) -> Result<Option<Document>>;

    async fn delete_many(&mut self, collection: Collection, filter: &Filter) -> Result<u64>;

    async fn commit(self) -> Result<()>;
}
