use crate::error::StoreError;
use crate::store::RefId;
use crate::util::{atomic_write, bincode_deserialize, bincode_serialize, now_millis};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// One value stored under a record key.
///
/// Values are kept as raw JSON bytes so the store file stays agnostic of the
/// shapes callers persist; `index` makes the value discoverable through
/// [`MetadataStore::search`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataValue {
    pub value: Vec<u8>,
    pub index: Option<String>,
}

impl MetadataValue {
    pub fn new<T: Serialize>(value: &T, index: Option<&str>) -> Result<Self, StoreError> {
        Ok(Self {
            value: serde_json::to_vec(value)?,
            index: index.map(str::to_owned),
        })
    }

    pub fn to_json<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_slice(&self.value)?)
    }

    pub fn index(&self) -> Option<&str> {
        self.index.as_deref()
    }
}

/// A record: the key/value bag attached to one ref id.
pub type MetadataRecord = BTreeMap<String, MetadataValue>;

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    // Keep this the first field: with fixint little-endian encoding it doubles
    // as a 4-byte version prefix readable before full deserialization.
    schema_version: u32,
    created_at_millis: u64,
    mutations: u64,
    records: BTreeMap<RefId, MetadataRecord>,
}

impl StoreFile {
    fn fresh() -> Self {
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            created_at_millis: now_millis(),
            mutations: 0,
            records: BTreeMap::new(),
        }
    }
}

/// Aggregate counters for diagnostics and tests.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MetadataStoreStats {
    /// Number of records currently in the store.
    pub records: usize,
    /// Number of persisted mutations since the store file was created.
    pub mutations: u64,
}

/// A persistent, indexed, per-ref key/value store.
///
/// One bincode file holds every record; each mutation rewrites it atomically
/// (temp + rename) under the store lock, so a record update is a small scoped
/// transaction: read, modify, persist, all while holding the lock.
///
/// The store is shared: the ref store keeps its bookkeeping here and sources
/// attach their own keys to the same records, which is what makes indexed
/// lookups like "every ref carrying this shared key" possible.
#[derive(Clone)]
pub struct MetadataStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    path: PathBuf,
    state: Mutex<StoreFile>,
}

impl std::fmt::Debug for MetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataStore")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

impl MetadataStore {
    /// Open the store file at `path`, creating an empty store if it does not
    /// exist yet.
    ///
    /// A file written by a different schema version fails with
    /// [`StoreError::IncompatibleSchemaVersion`]; migration is a caller
    /// decision, never silent data loss.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = match std::fs::read(&path) {
            Ok(bytes) => {
                if bytes.len() >= 4 {
                    let found = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                    if found != METADATA_SCHEMA_VERSION {
                        return Err(StoreError::IncompatibleSchemaVersion {
                            expected: METADATA_SCHEMA_VERSION,
                            found,
                        });
                    }
                }
                bincode_deserialize::<StoreFile>(&bytes)?
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoreFile::fresh(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            inner: Arc::new(StoreInner {
                path,
                state: Mutex::new(state),
            }),
        })
    }

    /// Handle for the record of `id`. Always succeeds; a record that was never
    /// written reads as empty.
    pub fn get(&self, id: &RefId) -> StorageItem {
        StorageItem {
            store: self.clone(),
            id: id.clone(),
        }
    }

    /// All records holding at least one value indexed under `index`, in ref id
    /// order.
    ///
    /// Many records may share an index value; superseded entries are not
    /// removed when a newer record claims the same index.
    pub fn search(&self, index: &str) -> Vec<StorageItem> {
        let state = self.lock_state();
        state
            .records
            .iter()
            .filter(|(_, record)| {
                record
                    .values()
                    .any(|value| value.index.as_deref() == Some(index))
            })
            .map(|(id, _)| StorageItem {
                store: self.clone(),
                id: id.clone(),
            })
            .collect()
    }

    /// Delete the record of `id`, including any index entries it carried.
    pub fn remove(&self, id: &RefId) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        if state.records.remove(id).is_none() {
            return Ok(());
        }
        state.mutations += 1;
        self.persist(&state)
    }

    /// Ids of every record, in order.
    pub fn ids(&self) -> Vec<RefId> {
        self.lock_state().records.keys().cloned().collect()
    }

    pub fn stats(&self) -> MetadataStoreStats {
        let state = self.lock_state();
        MetadataStoreStats {
            records: state.records.len(),
            mutations: state.mutations,
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreFile> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, state: &StoreFile) -> Result<(), StoreError> {
        let bytes = bincode_serialize(state)?;
        atomic_write(&self.inner.path, &bytes)
    }
}

/// Handle on one record of a [`MetadataStore`].
#[derive(Clone)]
pub struct StorageItem {
    store: MetadataStore,
    id: RefId,
}

impl std::fmt::Debug for StorageItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageItem").field("id", &self.id).finish()
    }
}

impl StorageItem {
    pub fn id(&self) -> &RefId {
        &self.id
    }

    pub fn get(&self, key: &str) -> Option<MetadataValue> {
        let state = self.store.lock_state();
        state
            .records
            .get(&self.id)
            .and_then(|record| record.get(key))
            .cloned()
    }

    /// Decoded convenience for [`Self::get`].
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.get(key) {
            Some(value) => Ok(Some(value.to_json()?)),
            None => Ok(None),
        }
    }

    /// Encode `value` as JSON and store it under `key`, optionally indexed.
    pub fn set_value<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        index: Option<&str>,
    ) -> Result<(), StoreError> {
        let encoded = MetadataValue::new(value, index)?;
        self.update(|record| {
            record.insert(key.to_owned(), encoded);
        })
    }

    /// Run `f` against the record under the store lock and persist once.
    ///
    /// The closure sees and edits the live record; concurrent readers observe
    /// either the state before or after, never a half-applied record. A record
    /// left empty by the closure is dropped from the store.
    pub fn update<R>(&self, f: impl FnOnce(&mut MetadataRecord) -> R) -> Result<R, StoreError> {
        let mut state = self.store.lock_state();
        let record = state.records.entry(self.id.clone()).or_default();
        let out = f(record);
        if record.is_empty() {
            state.records.remove(&self.id);
        }
        state.mutations += 1;
        self.store.persist(&state)?;
        Ok(out)
    }
}
