// canonsync/src/persistence.rs - Canonical document storage on NATS KV with revision-checked writes

use async_nats::jetstream::kv::{self, Config as KvConfig, CreateErrorKind, Store, UpdateErrorKind};
use async_nats::jetstream::Context;
use anyhow::{Error, Result};
use bytes::Bytes;
use canonsync_core::{CanonicalDocument, WorkError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, instrument, trace, warn};

/// Opaque token for a conditional write: the revision the document was read at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConcurrencyToken(u64);

impl ConcurrencyToken {
    pub fn new(revision: u64) -> Self {
        Self(revision)
    }

    pub fn revision(&self) -> u64 {
        self.0
    }
}

/// Raw document body plus the token it was read at
#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub body: Bytes,
    pub token: ConcurrencyToken,
}

/// Point reads and conditional writes of canonical documents.
///
/// `write` with a token succeeds only if the document is still at that token;
/// without a token it succeeds only if the document does not exist yet. Both
/// failure modes surface as [`WorkError::Conflict`].
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, id: &str) -> Result<Option<StoredDocument>, WorkError>;

    async fn write(
        &self,
        id: &str,
        body: Bytes,
        token: Option<ConcurrencyToken>,
    ) -> Result<ConcurrencyToken, WorkError>;
}

/// Read and decode a typed document
pub async fn load_document<D: CanonicalDocument>(
    store: &dyn DocumentStore,
    id: &str,
) -> Result<Option<(D, ConcurrencyToken)>, WorkError> {
    match store.read(id).await? {
        Some(stored) => {
            let doc: D = serde_json::from_slice(&stored.body).map_err(|e| {
                WorkError::Deserialization(format!("Stored document {id} could not be decoded: {e}"))
            })?;
            Ok(Some((doc, stored.token)))
        }
        None => Ok(None),
    }
}

/// Encode and conditionally write a typed document
pub async fn save_document<D: CanonicalDocument>(
    store: &dyn DocumentStore,
    doc: &D,
    token: Option<ConcurrencyToken>,
) -> Result<ConcurrencyToken, WorkError> {
    let body = serde_json::to_vec(doc)
        .map_err(|e| WorkError::Other(format!("Failed to serialize document {}: {e}", doc.id())))?;
    store.write(&doc.id().to_string(), Bytes::from(body), token).await
}

// ============ NATS KV STORE ============

/// NATS KV-backed document store. One bucket per database, keys prefixed by container.
#[derive(Clone, Debug)]
pub struct KvDocumentStore {
    bucket: Store,
    bucket_name: String,
    container: String,
}

impl KvDocumentStore {
    pub async fn new_from_context(context: &Context, bucket_name: &str, container: &str) -> Result<Self> {
        let bucket = get_or_create_bucket(context, bucket_name, 5).await?;

        info!("✅ Document store initialized with NATS KV bucket: {} (container {})", bucket_name, container);
        Ok(KvDocumentStore {
            bucket,
            bucket_name: bucket_name.to_string(),
            container: container.to_string(),
        })
    }

    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    fn key(&self, id: &str) -> String {
        format!("{}.{}", self.container, id)
    }

    /// Health check for the KV store
    pub async fn health_check(&self) -> Result<()> {
        let status = self
            .bucket
            .status()
            .await
            .map_err(|e| Error::msg(format!("Health check failed for bucket {}: {:?}", self.bucket_name, e)))?;
        debug!("Document store health check passed ({} values)", status.values());
        Ok(())
    }
}

#[async_trait::async_trait]
impl DocumentStore for KvDocumentStore {
    #[instrument(name = "state.load", level = "debug", skip(self))]
    async fn read(&self, id: &str) -> Result<Option<StoredDocument>, WorkError> {
        let key = self.key(id);
        trace!("Reading document {}", key);

        match self.bucket.entry(&key).await {
            Ok(Some(entry)) if matches!(entry.operation, kv::Operation::Put) => {
                debug!("Found document {} at revision {} ({} bytes)", key, entry.revision, entry.value.len());
                Ok(Some(StoredDocument {
                    body: entry.value,
                    token: ConcurrencyToken(entry.revision),
                }))
            }
            Ok(_) => {
                debug!("No document found for {}", key);
                Ok(None)
            }
            Err(err) => {
                let err_msg = format!("Failed to read document @ {}: {:?}", key, err);
                error!(error = %err, message = err_msg);
                Err(WorkError::Transient(err_msg))
            }
        }
    }

    #[instrument(name = "state.persist", level = "debug", skip(self, body))]
    async fn write(
        &self,
        id: &str,
        body: Bytes,
        token: Option<ConcurrencyToken>,
    ) -> Result<ConcurrencyToken, WorkError> {
        let key = self.key(id);

        let revision = match token {
            Some(expected) => self
                .bucket
                .update(&key, body, expected.revision())
                .await
                .map_err(|err| {
                    if matches!(err.kind(), UpdateErrorKind::WrongLastRevision) {
                        warn!("Stale write to {} (expected revision {})", key, expected.revision());
                        WorkError::Conflict(format!(
                            "Document {id} changed since revision {}",
                            expected.revision()
                        ))
                    } else {
                        let err_msg = format!("Failed to write document @ {}: {:?}", key, err);
                        error!(error = %err, message = err_msg);
                        WorkError::Transient(err_msg)
                    }
                })?,
            None => self.bucket.create(&key, body).await.map_err(|err| {
                if matches!(err.kind(), CreateErrorKind::AlreadyExists) {
                    warn!("Concurrent creation of {}", key);
                    WorkError::Conflict(format!("Document {id} was created concurrently"))
                } else {
                    let err_msg = format!("Failed to create document @ {}: {:?}", key, err);
                    error!(error = %err, message = err_msg);
                    WorkError::Transient(err_msg)
                }
            })?,
        };

        debug!("Document written for {} with revision {}", key, revision);
        Ok(ConcurrencyToken(revision))
    }
}

async fn get_or_create_bucket(js: &Context, bucket_name: &str, max_retries: u32) -> Result<Store> {
    info!("🔧 Initializing NATS KV bucket: {} (with {} retries)", bucket_name, max_retries);

    for attempt in 1..=max_retries {
        match js.get_key_value(bucket_name).await {
            Ok(store) => {
                info!("✅ Using existing KV bucket: {}", bucket_name);
                return Ok(store);
            }
            Err(e) => {
                debug!("Bucket doesn't exist yet, will try to create: {:?}", e);
            }
        }

        // history 1: the change feed only ever needs the latest snapshot of a document
        let config = KvConfig {
            bucket: bucket_name.to_string(),
            description: "Canonical document storage".to_string(),
            history: 1,
            storage: async_nats::jetstream::stream::StorageType::File,
            ..Default::default()
        };

        match js.create_key_value(config).await {
            Ok(store) => {
                info!("✅ Created new KV bucket: {} on attempt {}", bucket_name, attempt);
                return Ok(store);
            }
            Err(e) => {
                warn!("Attempt {} failed to create bucket: {:?}", attempt, e);

                if attempt == max_retries {
                    return Err(Error::msg(format!(
                        "Failed to create KV bucket {} after {} attempts. Last error: {:?}",
                        bucket_name, max_retries, e
                    )));
                }

                // Progressive backoff
                let delay_ms = 500 * attempt as u64;
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
        }
    }

    Err(Error::msg("Unexpected end of retry loop"))
}

// ============ IN-MEMORY STORE ============

#[derive(Debug, Default)]
struct MemoryBucket {
    documents: HashMap<String, (u64, Bytes)>,
    last_revision: u64,
    writes: usize,
}

/// Revision-checked in-memory store with the same conditional-write contract as the KV store
#[derive(Clone, Debug, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<Mutex<MemoryBucket>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> usize {
        self.lock().writes
    }

    pub fn len(&self) -> usize {
        self.lock().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get<D: CanonicalDocument>(&self, id: &str) -> Option<D> {
        self.lock()
            .documents
            .get(id)
            .and_then(|(_, body)| serde_json::from_slice(body).ok())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryBucket> {
        // a poisoned lock only means another test thread panicked mid-write
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn read(&self, id: &str) -> Result<Option<StoredDocument>, WorkError> {
        Ok(self.lock().documents.get(id).map(|(revision, body)| StoredDocument {
            body: body.clone(),
            token: ConcurrencyToken(*revision),
        }))
    }

    async fn write(
        &self,
        id: &str,
        body: Bytes,
        token: Option<ConcurrencyToken>,
    ) -> Result<ConcurrencyToken, WorkError> {
        let mut bucket = self.lock();
        let current = bucket.documents.get(id).map(|(revision, _)| *revision);
        match (token, current) {
            (Some(expected), Some(actual)) if expected.revision() == actual => {}
            (Some(expected), _) => {
                return Err(WorkError::Conflict(format!(
                    "Document {id} changed since revision {}",
                    expected.revision()
                )))
            }
            (None, Some(_)) => {
                return Err(WorkError::Conflict(format!("Document {id} was created concurrently")))
            }
            (None, None) => {}
        }

        bucket.last_revision += 1;
        let revision = bucket.last_revision;
        bucket.documents.insert(id.to_string(), (revision, body));
        bucket.writes += 1;
        Ok(ConcurrencyToken(revision))
    }
}
