use crate::blob_store::BlobStore;
use crate::error::{DatasetError, Result};
use crate::metadata_store::MetadataStore;
use crate::models::{DatasetQuery, DatasetRecord};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Upload, list, download and delete for dataset archives
#[derive(Clone)]
pub struct DatasetService {
    metadata: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    key_prefix: String,
}

impl DatasetService {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        key_prefix: impl Into<String>,
    ) -> Self {
        Self {
            metadata,
            blobs,
            key_prefix: key_prefix.into(),
        }
    }

    /// Store the archive at `archive_path` under `name` as a new `Pending` dataset.
    ///
    /// A taken name is rejected before anything is written. Two concurrent
    /// uploads of the same name can both pass that check; the unique index
    /// on `name` then rejects the second insert, but its archive has already
    /// overwritten the shared key.
    #[instrument(skip(self, archive_path))]
    pub async fn upload(
        &self,
        name: &str,
        category: &str,
        archive_path: &Path,
    ) -> Result<DatasetRecord> {
        let name = name.trim();
        if name.is_empty() {
            return Err(DatasetError::InvalidInput(
                "dataset name must not be empty".to_string(),
            ));
        }

        if self.metadata.find_by_name(name).await?.is_some() {
            return Err(DatasetError::Conflict(format!(
                "dataset '{}' already exists",
                name
            )));
        }

        let record = DatasetRecord::new(name, category.trim(), &self.key_prefix);
        self.blobs.put(&record.blob_key, archive_path).await?;
        self.metadata.insert(&record).await?;

        metrics::counter!("dataset.uploads").increment(1);
        info!(id = %record.id, blob_key = %record.blob_key, "Dataset uploaded");

        Ok(record)
    }

    pub async fn list(&self, query: &DatasetQuery) -> Result<Vec<DatasetRecord>> {
        self.metadata.list(query).await
    }

    /// Copy the current archive of `name` to `dest`
    #[instrument(skip(self, dest))]
    pub async fn download(&self, name: &str, dest: &Path) -> Result<DatasetRecord> {
        let record = self.require(name).await?;
        self.blobs.get(&record.blob_key, dest).await?;
        Ok(record)
    }

    /// Remove the archive of `name`, then its record.
    ///
    /// If the record delete fails after the archive is gone, the record is
    /// left dangling; nothing compensates.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let record = self.require(name).await?;

        self.blobs.delete(&record.blob_key).await?;
        if !self.metadata.delete_by_name(name).await? {
            warn!(dataset = %name, "Record vanished before it could be deleted");
        }

        metrics::counter!("dataset.deletes").increment(1);
        info!(id = %record.id, "Dataset deleted");
        Ok(())
    }

    /// Readiness probe against the metadata store
    pub async fn ping(&self) -> Result<()> {
        self.metadata.ping().await
    }

    async fn require(&self, name: &str) -> Result<DatasetRecord> {
        self.metadata
            .find_by_name(name)
            .await?
            .ok_or_else(|| DatasetError::NotFound(format!("dataset '{}'", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LabelStatus;
    use crate::testing::{MemoryBlobStore, MemoryMetadataStore};
    use std::fs;

    const PREFIX: &str = "AI/train/I2M";

    fn service() -> (DatasetService, Arc<MemoryMetadataStore>, Arc<MemoryBlobStore>) {
        let metadata = Arc::new(MemoryMetadataStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let service = DatasetService::new(metadata.clone(), blobs.clone(), PREFIX);
        (service, metadata, blobs)
    }

    fn archive(dir: &Path, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_upload_creates_pending_record() {
        let (service, metadata, blobs) = service();
        let tmp = tempfile::tempdir().unwrap();

        let record = service
            .upload("  cats ", "sdxl", &archive(tmp.path(), "a.zip", "zip-a"))
            .await
            .unwrap();

        assert_eq!(record.name, "cats");
        assert_eq!(record.status, LabelStatus::Pending);
        assert_eq!(record.blob_key, "AI/train/I2M/cats.zip");
        assert_eq!(blobs.object(&record.blob_key).unwrap(), b"zip-a");
        assert_eq!(metadata.get(record.id).unwrap(), record);
    }

    #[tokio::test]
    async fn test_duplicate_upload_conflicts() {
        let (service, metadata, blobs) = service();
        let tmp = tempfile::tempdir().unwrap();

        let first = service
            .upload("cats", "sdxl", &archive(tmp.path(), "a.zip", "zip-a"))
            .await
            .unwrap();
        let err = service
            .upload("cats", "flux", &archive(tmp.path(), "b.zip", "zip-b"))
            .await
            .unwrap_err();

        assert!(matches!(err, DatasetError::Conflict(_)));
        assert_eq!(metadata.get(first.id).unwrap(), first);
        assert_eq!(blobs.object(&first.blob_key).unwrap(), b"zip-a");
        assert_eq!(service.list(&DatasetQuery::default()).await.unwrap().len(), 1);
    }

    /// Lookup that never sees existing records, as when a concurrent upload
    /// inserts between the name check and the insert
    struct StaleLookup(Arc<MemoryMetadataStore>);

    #[async_trait::async_trait]
    impl MetadataStore for StaleLookup {
        async fn find_by_name(&self, _name: &str) -> Result<Option<DatasetRecord>> {
            Ok(None)
        }

        async fn insert(&self, record: &DatasetRecord) -> Result<uuid::Uuid> {
            self.0.insert(record).await
        }

        async fn claim_one_pending(&self) -> Result<Option<DatasetRecord>> {
            self.0.claim_one_pending().await
        }

        async fn set_status(&self, id: uuid::Uuid, status: LabelStatus) -> Result<()> {
            self.0.set_status(id, status).await
        }

        async fn delete_by_name(&self, name: &str) -> Result<bool> {
            self.0.delete_by_name(name).await
        }

        async fn list(&self, query: &DatasetQuery) -> Result<Vec<DatasetRecord>> {
            self.0.list(query).await
        }
    }

    #[tokio::test]
    async fn test_racing_upload_is_rejected_by_insert() {
        let (service, metadata, blobs) = service();
        let tmp = tempfile::tempdir().unwrap();
        let first = service
            .upload("cats", "sdxl", &archive(tmp.path(), "a.zip", "zip-a"))
            .await
            .unwrap();

        let racing = DatasetService::new(
            Arc::new(StaleLookup(metadata.clone())),
            blobs.clone(),
            PREFIX,
        );
        let err = racing
            .upload("cats", "flux", &archive(tmp.path(), "b.zip", "zip-b"))
            .await
            .unwrap_err();

        assert!(matches!(err, DatasetError::Conflict(_)));
        let records = metadata.list(&DatasetQuery::default()).await.unwrap();
        assert_eq!(records, vec![first.clone()]);
        // The losing upload already replaced the archive behind the surviving record.
        assert_eq!(blobs.object(&first.blob_key).unwrap(), b"zip-b");
    }

    #[tokio::test]
    async fn test_empty_name_is_invalid() {
        let (service, _, _) = service();
        let tmp = tempfile::tempdir().unwrap();

        let err = service
            .upload("   ", "sdxl", &archive(tmp.path(), "a.zip", "zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatasetError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_failed_blob_put_leaves_no_record() {
        let (service, _, blobs) = service();
        let tmp = tempfile::tempdir().unwrap();
        blobs.fail_puts();

        let err = service
            .upload("cats", "sdxl", &archive(tmp.path(), "a.zip", "zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatasetError::Store(_)));
        assert!(service.list(&DatasetQuery::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_download_copies_current_archive() {
        let (service, _, _) = service();
        let tmp = tempfile::tempdir().unwrap();
        service
            .upload("cats", "sdxl", &archive(tmp.path(), "a.zip", "zip-a"))
            .await
            .unwrap();

        let dest = tmp.path().join("out.zip");
        service.download("cats", &dest).await.unwrap();
        assert_eq!(fs::read(dest).unwrap(), b"zip-a");
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (service, _, _) = service();
        let err = service.delete("never-uploaded").await.unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_blob_and_record() {
        let (service, metadata, blobs) = service();
        let tmp = tempfile::tempdir().unwrap();
        let record = service
            .upload("cats", "sdxl", &archive(tmp.path(), "a.zip", "zip-a"))
            .await
            .unwrap();

        service.delete("cats").await.unwrap();

        assert!(blobs.object(&record.blob_key).is_none());
        assert!(metadata.get(record.id).is_none());
        let err = service
            .download("cats", &tmp.path().join("out.zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failed_blob_delete_keeps_record() {
        let (service, metadata, blobs) = service();
        let tmp = tempfile::tempdir().unwrap();
        let record = service
            .upload("cats", "sdxl", &archive(tmp.path(), "a.zip", "zip-a"))
            .await
            .unwrap();
        blobs.fail_deletes();

        assert!(service.delete("cats").await.is_err());
        assert!(metadata.get(record.id).is_some());
        assert!(blobs.object(&record.blob_key).is_some());
    }

    #[tokio::test]
    async fn test_failed_record_delete_leaves_dangling_record() {
        let (service, metadata, blobs) = service();
        let tmp = tempfile::tempdir().unwrap();
        let record = service
            .upload("cats", "sdxl", &archive(tmp.path(), "a.zip", "zip-a"))
            .await
            .unwrap();
        metadata.fail_deletes(true);

        let err = service.delete("cats").await.unwrap_err();
        assert!(matches!(err, DatasetError::Store(_)));
        assert!(blobs.object(&record.blob_key).is_none());
        assert!(metadata.get(record.id).is_some());

        // Retrying once the store recovers removes the dangling record.
        metadata.fail_deletes(false);
        service.delete("cats").await.unwrap();
        assert!(metadata.get(record.id).is_none());
        let err = service.delete("cats").await.unwrap_err();
        assert!(matches!(err, DatasetError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (service, _, _) = service();
        let tmp = tempfile::tempdir().unwrap();
        let path = archive(tmp.path(), "a.zip", "zip");
        service.upload("Street-Cats", "sdxl", &path).await.unwrap();
        service.upload("dogs", "sdxl", &path).await.unwrap();
        service.upload("cats-flux", "flux", &path).await.unwrap();

        let query = DatasetQuery {
            keyword: Some("CATS".into()),
            category: Some("sdxl".into()),
        };
        let names: Vec<_> = service
            .list(&query)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["Street-Cats"]);
    }
}
