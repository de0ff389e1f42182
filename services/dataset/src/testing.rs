use crate::blob_store::BlobStore;
use crate::error::{DatasetError, Result};
use crate::metadata_store::MetadataStore;
use crate::models::{DatasetQuery, DatasetRecord, LabelStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

/// Metadata store under one lock: claims are atomic, names are unique and
/// status updates follow the state machine
#[derive(Default)]
pub struct MemoryMetadataStore {
    records: Mutex<Vec<DatasetRecord>>,
    transitions: Mutex<Vec<(Uuid, LabelStatus)>>,
    fail_deletes: AtomicBool,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<DatasetRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.id == id)
            .cloned()
    }

    /// Every status a record has been moved to, in order
    pub fn transitions_of(&self, id: Uuid) -> Vec<LabelStatus> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .filter(|(rid, _)| *rid == id)
            .map(|(_, status)| *status)
            .collect()
    }

    /// Make `delete_by_name` fail until switched off again
    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn find_by_name(&self, name: &str) -> Result<Option<DatasetRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.name == name)
            .cloned())
    }

    async fn insert(&self, record: &DatasetRecord) -> Result<Uuid> {
        let mut records = self.records.lock().unwrap();
        if records.iter().any(|r| r.name == record.name) {
            return Err(DatasetError::Conflict(format!(
                "dataset '{}' already exists",
                record.name
            )));
        }
        records.push(record.clone());
        Ok(record.id)
    }

    async fn claim_one_pending(&self) -> Result<Option<DatasetRecord>> {
        let mut records = self.records.lock().unwrap();
        let Some(record) = records
            .iter_mut()
            .find(|r| r.status == LabelStatus::Pending)
        else {
            return Ok(None);
        };

        record.status = LabelStatus::Processing;
        self.transitions
            .lock()
            .unwrap()
            .push((record.id, LabelStatus::Processing));
        Ok(Some(record.clone()))
    }

    async fn set_status(&self, id: Uuid, status: LabelStatus) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .iter_mut()
            .find(|r| r.id == id && r.status.can_transition_to(status))
            .ok_or_else(|| {
                DatasetError::Store(format!("record {} cannot move to {:?}", id, status))
            })?;

        record.status = status;
        self.transitions.lock().unwrap().push((id, status));
        Ok(())
    }

    async fn delete_by_name(&self, name: &str) -> Result<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(DatasetError::Store(format!("delete of '{}' rejected", name)));
        }
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|r| r.name != name);
        Ok(records.len() != before)
    }

    async fn list(&self, query: &DatasetQuery) -> Result<Vec<DatasetRecord>> {
        let mut matching: Vec<DatasetRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching)
    }
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), data);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn fail_puts(&self) {
        self.fail_puts.store(true, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, local_path: &Path) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(DatasetError::Store(format!("put {} rejected", key)));
        }
        let data = tokio::fs::read(local_path).await?;
        self.insert(key, data);
        Ok(())
    }

    async fn get(&self, key: &str, local_path: &Path) -> Result<()> {
        let data = self
            .object(key)
            .ok_or_else(|| DatasetError::NotFound(format!("object {}", key)))?;
        tokio::fs::write(local_path, data).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(DatasetError::Store(format!("delete {} rejected", key)));
        }
        self.objects.lock().unwrap().remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }
}

/// Build a zip archive in memory from `(entry name, contents)` pairs
pub fn zip_bytes(entries: &[(&str, &str)]) -> Vec<u8> {
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    let mut buffer = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buffer));
        for (name, contents) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(contents.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }
    buffer
}

/// Read every entry of a zip archive held in memory
pub fn unzip_bytes(data: &[u8]) -> HashMap<String, Vec<u8>> {
    use std::io::Read;

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(data)).unwrap();
    let mut entries = HashMap::new();
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).unwrap();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents).unwrap();
        entries.insert(file.name().to_string(), contents);
    }
    entries
}
