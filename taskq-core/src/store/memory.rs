//! A complete in-process store backend. Used by the test suites and by dev
//! deployments where durability beyond process lifetime is not needed.
//!
//! All collections live behind one async mutex. Scoped transactions take the
//! lock for their whole extent and keep a snapshot for rollback, which gives
//! read-your-write and all-or-nothing trivially; conditional updates still
//! behave exactly like the production backend because every mutation
//! re-evaluates its filter under the lock.

use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::document::{path_get, Document};
use crate::error::{Error, Result};
use crate::filter::{compare_values, matches, Filter};
use crate::store::{
    Collection, FindOptions, Patch, RecordStore, ReturnDocument, SortOrder, StoreSession,
};

#[derive(Debug, Default, Clone)]
struct Collections {
    queues: Vec<Document>,
    tasks: Vec<Document>,
    workers: Vec<Document>,
    events: Vec<Document>,
}

impl Collections {
    fn col(&self, collection: Collection) -> &Vec<Document> {
        match collection {
            Collection::Queues => &self.queues,
            Collection::Tasks => &self.tasks,
            Collection::Workers => &self.workers,
            Collection::Events => &self.events,
        }
    }

    fn col_mut(&mut self, collection: Collection) -> &mut Vec<Document> {
        match collection {
            Collection::Queues => &mut self.queues,
            Collection::Tasks => &mut self.tasks,
            Collection::Workers => &mut self.workers,
            Collection::Events => &mut self.events,
        }
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Collections>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

fn find_one_in(data: &Collections, collection: Collection, filter: &Filter) -> Result<Option<Document>> {
    for doc in data.col(collection) {
        if matches(filter, doc)? {
            return Ok(Some(doc.clone()));
        }
    }
    Ok(None)
}

fn find_many_in(
    data: &Collections,
    collection: Collection,
    filter: &Filter,
    options: &FindOptions,
) -> Result<Vec<Document>> {
    let mut found = Vec::new();
    for doc in data.col(collection) {
        if matches(filter, doc)? {
            found.push(doc.clone());
        }
    }
    sort_documents(&mut found, &options.sort);
    let out: Vec<Document> = found
        .into_iter()
        .skip(options.offset)
        .take(options.limit.unwrap_or(usize::MAX))
        .collect();
    Ok(out)
}

/// Stable sort, so insertion order breaks ties within equal keys.
fn sort_documents(docs: &mut [Document], sort: &[(String, SortOrder)]) {
    if sort.is_empty() {
        return;
    }
    docs.sort_by(|a, b| {
        for (field, order) in sort {
            let ordering = cmp_field(path_get(a, field), path_get(b, field));
            let ordering = match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

fn cmp_field(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(_) => 4,
        }
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or_else(|| rank(a).cmp(&rank(b))),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn insert_in(data: &mut Collections, collection: Collection, doc: Document) -> Result<()> {
    check_unique(data, collection, &doc)?;
    data.col_mut(collection).push(doc);
    Ok(())
}

/// Enforce the backend's unique indexes: `queues.queue_name` and
/// `events.(queue_id, sequence)`. The event conflict is transient by
/// contract: the journal re-reads the max sequence and retries.
fn check_unique(data: &Collections, collection: Collection, doc: &Document) -> Result<()> {
    if let Some(existing_id) = doc.get("_id") {
        if data
            .col(collection)
            .iter()
            .any(|d| d.get("_id") == Some(existing_id))
        {
            return Err(Error::Conflict(format!(
                "duplicate _id in {}",
                collection.as_str()
            )));
        }
    }
    match collection {
        Collection::Queues => {
            let name = doc.get("queue_name");
            if data.queues.iter().any(|d| d.get("queue_name") == name) {
                return Err(Error::Conflict("queue_name already exists".into()));
            }
        }
        Collection::Events => {
            let key = (doc.get("queue_id"), doc.get("sequence"));
            if data
                .events
                .iter()
                .any(|d| (d.get("queue_id"), d.get("sequence")) == key)
            {
                return Err(Error::StoreTransient(
                    "duplicate event sequence for queue".into(),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

fn update_one_in(
    data: &mut Collections,
    collection: Collection,
    filter: &Filter,
    patch: &Patch,
) -> Result<u64> {
    Ok(
        match find_and_patch(data, collection, filter, patch)? {
            Some(_) => 1,
            None => 0,
        },
    )
}

fn find_one_and_update_in(
    data: &mut Collections,
    collection: Collection,
    filter: &Filter,
    patch: &Patch,
    ret: ReturnDocument,
) -> Result<Option<Document>> {
    match find_and_patch(data, collection, filter, patch)? {
        Some((before, after)) => Ok(Some(match ret {
            ReturnDocument::Before => before,
            ReturnDocument::After => after,
        })),
        None => Ok(None),
    }
}

fn find_and_patch(
    data: &mut Collections,
    collection: Collection,
    filter: &Filter,
    patch: &Patch,
) -> Result<Option<(Document, Document)>> {
    let docs = data.col_mut(collection);
    for doc in docs.iter_mut() {
        if matches(filter, doc)? {
            let before = doc.clone();
            patch.apply(doc);
            return Ok(Some((before, doc.clone())));
        }
    }
    Ok(None)
}

fn delete_many_in(data: &mut Collections, collection: Collection, filter: &Filter) -> Result<u64> {
    let docs = data.col_mut(collection);
    let before = docs.len();
    // retain has no fallible variant, so evaluate first
    let mut keep = Vec::with_capacity(before);
    for doc in docs.iter() {
        keep.push(!matches(filter, doc)?);
    }
    let mut keep_iter = keep.into_iter();
    docs.retain(|_| keep_iter.next().unwrap_or(true));
    Ok((before - docs.len()) as u64)
}

#[async_trait]
impl RecordStore for MemoryStore {
    type Session = MemorySession;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn find_one(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>> {
        let data = self.inner.lock().await;
        find_one_in(&data, collection, filter)
    }

    async fn find_many(
        &self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        let data = self.inner.lock().await;
        find_many_in(&data, collection, filter, options)
    }

    async fn insert(&self, collection: Collection, doc: Document) -> Result<()> {
        let mut data = self.inner.lock().await;
        insert_in(&mut data, collection, doc)
    }

    async fn update_one(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64> {
        let mut data = self.inner.lock().await;
        update_one_in(&mut data, collection, filter, patch)
    }

    async fn find_one_and_update(
        &self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
        ret: ReturnDocument,
    ) -> Result<Option<Document>> {
        let mut data = self.inner.lock().await;
        find_one_and_update_in(&mut data, collection, filter, patch, ret)
    }

    async fn delete_many(&self, collection: Collection, filter: &Filter) -> Result<u64> {
        let mut data = self.inner.lock().await;
        delete_many_in(&mut data, collection, filter)
    }

    async fn begin(&self, _queue_id: &str) -> Result<Self::Session> {
        let guard = self.inner.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(MemorySession {
            guard,
            snapshot,
            committed: false,
        })
    }
}

/// Holds the store lock for the transaction's extent. Rolls back to the
/// snapshot unless committed.
pub struct MemorySession {
    guard: OwnedMutexGuard<Collections>,
    snapshot: Collections,
    committed: bool,
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.committed {
            *self.guard = std::mem::take(&mut self.snapshot);
        }
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn find_one(
        &mut self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<Option<Document>> {
        find_one_in(&self.guard, collection, filter)
    }

    async fn find_many(
        &mut self,
        collection: Collection,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        find_many_in(&self.guard, collection, filter, options)
    }

    async fn insert(&mut self, collection: Collection, doc: Document) -> Result<()> {
        insert_in(&mut self.guard, collection, doc)
    }

    async fn update_one(
        &mut self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
    ) -> Result<u64> {
        update_one_in(&mut self.guard, collection, filter, patch)
    }

    async fn find_one_and_update(
        &mut self,
        collection: Collection,
        filter: &Filter,
        patch: &Patch,
        ret: ReturnDocument,
    ) -> Result<Option<Document>> {
        find_one_and_update_in(&mut self.guard, collection, filter, patch, ret)
    }

    async fn delete_many(&mut self, collection: Collection, filter: &Filter) -> Result<u64> {
        delete_many_in(&mut self.guard, collection, filter)
    }

    async fn commit(mut self) -> Result<()> {
        self.committed = true;
        Ok(())
    }
}
