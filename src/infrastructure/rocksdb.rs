use crate::domain::ports::{AdapterError, BackendAdapter, CallContext};
use crate::error::{BundleError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Options, WriteBatch};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Column Family holding stored records, keyed by `Kind/id`.
pub const CF_RECORDS: &str = "records";
/// Column Family mapping `Kind|idempotency-key` to the id it produced.
pub const CF_IDEMPOTENCY: &str = "idempotency";

/// A persistent backend using RocksDB.
///
/// Records and idempotency keys live in separate Column Families. Because the
/// key map is on disk, resubmitting a Bundle after a restart still resolves
/// to the ids assigned the first time.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDbBackend {
    name: String,
    db: Arc<DB>,
}

impl RocksDbBackend {
    /// Opens or creates a RocksDB instance at `path`, creating the
    /// `records` and `idempotency` column families when missing.
    pub fn open<P: AsRef<Path>>(name: impl Into<String>, path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_records = ColumnFamilyDescriptor::new(CF_RECORDS, Options::default());
        let cf_idempotency = ColumnFamilyDescriptor::new(CF_IDEMPOTENCY, Options::default());

        let db = DB::open_cf_descriptors(&opts, path, vec![cf_records, cf_idempotency])
            .map_err(|e| BundleError::Storage(e.to_string()))?;

        Ok(Self {
            name: name.into(),
            db: Arc::new(db),
        })
    }

    /// Reads a stored record back.
    pub fn get(&self, kind: &str, id: &str) -> std::result::Result<Option<Value>, AdapterError> {
        let cf = self.cf(CF_RECORDS)?;
        let Some(bytes) = self.db.get_cf(cf, record_key(kind, id)).map_err(storage)? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&bytes)
            .map_err(|e| AdapterError::Failed(format!("Deserialization error: {}", e)))?;
        Ok(Some(record))
    }

    fn cf(&self, name: &str) -> std::result::Result<&ColumnFamily, AdapterError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| AdapterError::Failed(format!("{} column family not found", name)))
    }
}

fn record_key(kind: &str, id: &str) -> Vec<u8> {
    format!("{}/{}", kind, id).into_bytes()
}

fn storage(err: rocksdb::Error) -> AdapterError {
    AdapterError::Failed(format!("RocksDB error: {}", err))
}

#[async_trait]
impl BackendAdapter for RocksDbBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(
        &self,
        kind: &str,
        payload: &Value,
        call: &CallContext,
    ) -> std::result::Result<String, AdapterError> {
        if !payload.is_object() {
            return Err(AdapterError::Rejected("payload is not a JSON object".to_string()));
        }
        let records = self.cf(CF_RECORDS)?;
        let idempotency = self.cf(CF_IDEMPOTENCY)?;

        let key = call
            .idempotency_key
            .as_ref()
            .map(|key| format!("{}|{}", kind, key).into_bytes());
        let known = match &key {
            Some(key) => self
                .db
                .get_cf(idempotency, key)
                .map_err(storage)?
                .and_then(|bytes| String::from_utf8(bytes).ok()),
            None => None,
        };
        let id = match payload.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => known.unwrap_or_else(|| Uuid::new_v4().to_string()),
        };

        let mut record = payload.clone();
        if let Some(fields) = record.as_object_mut() {
            fields.insert("id".to_string(), Value::String(id.clone()));
        }
        let value = serde_json::to_vec(&record)
            .map_err(|e| AdapterError::Failed(format!("Serialization error: {}", e)))?;

        let mut batch = WriteBatch::default();
        batch.put_cf(records, record_key(kind, &id), value);
        if let Some(key) = key {
            batch.put_cf(idempotency, key, id.as_bytes());
        }
        self.db.write(batch).map_err(storage)?;

        Ok(id)
    }

    async fn delete(
        &self,
        kind: &str,
        id: &str,
        _call: &CallContext,
    ) -> std::result::Result<(), AdapterError> {
        let cf = self.cf(CF_RECORDS)?;
        self.db.delete_cf(cf, record_key(kind, id)).map_err(storage)
    }

    async fn is_healthy(&self) -> bool {
        self.db.cf_handle(CF_RECORDS).is_some() && self.db.cf_handle(CF_IDEMPOTENCY).is_some()
    }
}
