use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use objloader_types::{Base, Item, ObjectId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::traits::Database;

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: usize = 8;

/// One persisted object.
///
/// On-disk framing:
/// ```text
/// [4 bytes: record length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [N bytes: payload (bincode-serialized StoredRecord)]
/// ```
///
/// The base is kept as JSON text because bincode cannot round-trip an
/// untyped JSON tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredRecord {
    id: String,
    base_json: String,
    size: Option<u64>,
}

impl StoredRecord {
    fn from_item(item: &Item) -> StoreResult<Option<Self>> {
        let Some(base) = &item.base else {
            return Ok(None);
        };
        let base_json =
            serde_json::to_string(base).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(Self {
            id: item.base_id.as_str().to_string(),
            base_json,
            size: item.size.map(|s| s as u64),
        }))
    }

    fn into_item(self) -> StoreResult<Item> {
        let base =
            Base::from_json(&self.base_json).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Item {
            base_id: ObjectId::new(self.id),
            base: Some(base),
            size: self.size.map(|s| s as usize),
            error: None,
        })
    }
}

/// Database persisted to an append-only log file.
///
/// On open the whole log is replayed into an in-memory index. Records that
/// fail the CRC check are skipped; a torn record at the tail ends recovery.
/// Writes append to the log and update the index. Survives across sessions.
pub struct FileDatabase {
    path: PathBuf,
    index: RwLock<HashMap<ObjectId, Item>>,
    /// `None` once disposed.
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FileDatabase {
    /// Open (or create) the log at `path`.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let index = recover(path)?;
        info!(path = %path.display(), objects = index.len(), "opened file database");

        Ok(Self {
            path: path.to_path_buf(),
            index: RwLock::new(index),
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// Path to the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.index.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.writer.lock().expect("lock poisoned").is_none() {
            return Err(StoreError::Disposed);
        }
        Ok(())
    }
}

impl Database for FileDatabase {
    fn get_all(&self, keys: &[ObjectId]) -> StoreResult<Vec<Option<Item>>> {
        self.check_open()?;
        let index = self.index.read().expect("lock poisoned");
        Ok(keys.iter().map(|key| index.get(key).cloned()).collect())
    }

    fn put_all(&self, items: &[Item]) -> StoreResult<()> {
        let mut guard = self.writer.lock().expect("lock poisoned");
        let writer = guard.as_mut().ok_or(StoreError::Disposed)?;
        let mut index = self.index.write().expect("lock poisoned");

        let mut written = 0usize;
        for item in items {
            if index.contains_key(&item.base_id) {
                continue;
            }
            let Some(record) = StoredRecord::from_item(item)? else {
                continue;
            };
            let payload =
                bincode::serialize(&record).map_err(|e| StoreError::Serialization(e.to_string()))?;
            let length = payload.len() as u32;
            let crc = crc32fast::hash(&payload);

            writer.write_all(&length.to_le_bytes())?;
            writer.write_all(&crc.to_le_bytes())?;
            writer.write_all(&payload)?;

            index.insert(item.base_id.clone(), item.clone());
            written += 1;
        }
        writer.flush()?;

        debug!(written, requested = items.len(), "file database put");
        Ok(())
    }

    fn all_items(&self) -> StoreResult<Vec<Item>> {
        self.check_open()?;
        Ok(self
            .index
            .read()
            .expect("lock poisoned")
            .values()
            .cloned()
            .collect())
    }

    fn clear(&self) -> StoreResult<()> {
        let mut guard = self.writer.lock().expect("lock poisoned");
        if guard.is_none() {
            return Err(StoreError::Disposed);
        }
        let file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        drop(file);
        let file = OpenOptions::new().append(true).open(&self.path)?;
        *guard = Some(BufWriter::new(file));
        self.index.write().expect("lock poisoned").clear();

        debug!(path = %self.path.display(), "file database cleared");
        Ok(())
    }

    fn dispose(&self) -> StoreResult<()> {
        let mut guard = self.writer.lock().expect("lock poisoned");
        if let Some(mut writer) = guard.take() {
            writer.flush()?;
            writer.get_ref().sync_all()?;
            self.index.write().expect("lock poisoned").clear();
            debug!(path = %self.path.display(), "file database disposed");
        }
        Ok(())
    }
}

/// Replay the log front-to-back into an index.
fn recover(path: &Path) -> StoreResult<HashMap<ObjectId, Item>> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let mut index = HashMap::new();
    let mut offset = 0usize;
    while offset + HEADER_SIZE <= bytes.len() {
        let header = &bytes[offset..offset + HEADER_SIZE];
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if length == 0 || offset + HEADER_SIZE + length > bytes.len() {
            warn!(offset, length, file_len = bytes.len(), "torn record; stopping recovery");
            break;
        }

        let payload = &bytes[offset + HEADER_SIZE..offset + HEADER_SIZE + length];
        offset += HEADER_SIZE + length;

        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            warn!(
                offset,
                expected = expected_crc,
                actual = actual_crc,
                "CRC mismatch; skipping record"
            );
            continue;
        }

        let item = bincode::deserialize::<StoredRecord>(payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))
            .and_then(StoredRecord::into_item);
        match item {
            Ok(item) => {
                index.entry(item.base_id.clone()).or_insert(item);
            }
            Err(e) => warn!(offset, error = %e, "undecodable record; skipping"),
        }
    }

    debug!(recovered = index.len(), "file database recovery complete");
    Ok(index)
}
