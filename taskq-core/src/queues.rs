//! Queue lifecycle: create, authenticate, update, delete (with cascade).

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use serde_json::json;

use crate::document::{from_document, merge_with_null_delete, to_document, Document};
use crate::engine::{now_ms, Engine};
use crate::error::{Error, Result};
use crate::filter::filter_from;
use crate::model::{new_id, QueueRecord};
use crate::store::{Collection, FindOptions, Patch, RecordStore, StoreSession};
use crate::validation::{validate_name, validate_optional_keys};

#[derive(Debug, Clone)]
pub struct CreateQueue {
    pub queue_name: String,
    pub password: String,
    pub metadata: Option<Document>,
}

#[derive(Debug, Clone, Default)]
pub struct QueueUpdate {
    pub new_queue_name: Option<String>,
    pub new_password: Option<String>,
    /// Deep-merge delta; null-valued keys delete.
    pub metadata_update: Option<Document>,
}

fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::StoreFatal(format!("password hashing failed: {e}")))?
        .to_string())
}

fn verify_password(password: &str, stored: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn validate_password(password: &str) -> Result<()> {
    if password.is_empty() || password.len() > 100 {
        return Err(Error::validation(
            "password must be between 1 and 100 characters",
        ));
    }
    Ok(())
}

impl<S: RecordStore> Engine<S> {
    pub async fn create_queue(&self, request: CreateQueue) -> Result<QueueRecord> {
        validate_name("queue", &request.queue_name)?;
        validate_password(&request.password)?;
        validate_optional_keys(request.metadata.as_ref())?;

        let name_filter = filter_from([("queue_name", json!(request.queue_name))]);
        if self
            .store
            .find_one(Collection::Queues, &name_filter)
            .await?
            .is_some()
        {
            return Err(Error::QueueExists(request.queue_name));
        }

        let now = now_ms();
        let record = QueueRecord {
            queue_id: new_id(),
            queue_name: request.queue_name.clone(),
            password_hash: hash_password(&request.password)?,
            created_at: now,
            last_modified: now,
            metadata: request.metadata.unwrap_or_default(),
        };
        match self
            .store
            .insert(Collection::Queues, to_document(&record)?)
            .await
        {
            Ok(()) => Ok(record),
            // racing creator won the unique index
            Err(Error::Conflict(_)) => Err(Error::QueueExists(request.queue_name)),
            Err(other) => Err(other),
        }
    }

    pub async fn get_queue(&self, queue_id: &str) -> Result<QueueRecord> {
        self.store
            .find_one(Collection::Queues, &filter_from([("_id", json!(queue_id))]))
            .await?
            .map(from_document)
            .transpose()?
            .ok_or(Error::NotFound("queue"))
    }

    /// Resolve basic-auth credentials to a verified queue record.
    pub async fn verify_queue(&self, queue_name: &str, password: &str) -> Result<QueueRecord> {
        let record: QueueRecord = self
            .store
            .find_one(
                Collection::Queues,
                &filter_from([("queue_name", json!(queue_name))]),
            )
            .await?
            .map(from_document)
            .transpose()?
            .ok_or(Error::Auth)?;
        if !verify_password(password, &record.password_hash) {
            return Err(Error::Auth);
        }
        Ok(record)
    }

    pub async fn update_queue(&self, queue_id: &str, update: QueueUpdate) -> Result<QueueRecord> {
        let mut record = self.get_queue(queue_id).await?;

        let mut patch = Patch::new();
        if let Some(new_name) = update.new_queue_name {
            validate_name("queue", &new_name)?;
            if new_name != record.queue_name {
                let taken = self
                    .store
                    .find_one(
                        Collection::Queues,
                        &filter_from([("queue_name", json!(new_name))]),
                    )
                    .await?;
                if taken.is_some() {
                    return Err(Error::QueueExists(new_name));
                }
                record.queue_name = new_name.clone();
                patch = patch.set("queue_name", json!(new_name));
            }
        }
        if let Some(new_password) = update.new_password {
            validate_password(&new_password)?;
            let hash = hash_password(&new_password)?;
            record.password_hash = hash.clone();
            patch = patch.set("password_hash", json!(hash));
        }
        if let Some(delta) = update.metadata_update {
            // null-valued keys are deletions, but key legality still holds
            validate_optional_keys(Some(&delta))?;
            merge_with_null_delete(&mut record.metadata, &delta);
            patch = patch.set("metadata", json!(record.metadata.clone()));
        }

        let now = now_ms();
        record.last_modified = now;
        patch = patch.set("last_modified", json!(now.timestamp_millis()));

        let matched = self
            .store
            .update_one(
                Collection::Queues,
                &filter_from([("_id", json!(queue_id))]),
                &patch,
            )
            .await?;
        if matched == 0 {
            return Err(Error::NotFound("queue"));
        }
        Ok(record)
    }

    /// Delete a queue. With `cascade` every task, worker and event scoped to
    /// it goes in the same transaction; without it the call fails while
    /// tasks or workers remain.
    pub async fn delete_queue(&self, queue_id: &str, cascade: bool) -> Result<()> {
        let mut session = self.store.begin(queue_id).await?;
        let scope = filter_from([("queue_id", json!(queue_id))]);

        if !cascade {
            for collection in [Collection::Tasks, Collection::Workers] {
                let children = session
                    .find_many(collection, &scope, &FindOptions::limit(1))
                    .await?;
                if !children.is_empty() {
                    return Err(Error::QueueNotEmpty);
                }
            }
        } else {
            session.delete_many(Collection::Tasks, &scope).await?;
            session.delete_many(Collection::Workers, &scope).await?;
            session.delete_many(Collection::Events, &scope).await?;
        }

        let deleted = session
            .delete_many(Collection::Queues, &filter_from([("_id", json!(queue_id))]))
            .await?;
        if deleted == 0 {
            return Err(Error::NotFound("queue"));
        }
        session.commit().await
    }
}
