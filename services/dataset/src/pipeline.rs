use crate::archive::{self, CodecError};
use crate::blob_store::BlobStore;
use crate::captioning::Captioner;
use crate::error::DatasetError;
use crate::metadata_store::MetadataStore;
use crate::models::{sanitize_path_component, DatasetRecord, LabelStatus};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Name of the filename -> caption manifest written next to the images
pub const MANIFEST_FILE: &str = "labels.json";

/// Extensions (lower-case) that are sent for captioning
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Pipeline stage, used to report where a job failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Extract,
    Label,
    Manifest,
    Repack,
    Publish,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Label => "label",
            Stage::Manifest => "manifest",
            Stage::Repack => "repack",
            Stage::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// A stage failure that ends the job
#[derive(Error, Debug)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: DatasetError,
}

impl PipelineError {
    fn at(stage: Stage) -> impl FnOnce(DatasetError) -> Self {
        move |source| Self { stage, source }
    }
}

/// What the label stage did with the extracted files
#[derive(Debug, Default, Clone)]
pub struct LabelingReport {
    /// Renamed file name -> caption, sorted by file name
    pub labels: BTreeMap<String, String>,
    /// Files that received a sequence number
    pub images: usize,
    /// Files skipped for not being images
    pub skipped: usize,
    /// Image files that could not be read and were deleted
    pub unreadable: usize,
    /// Renamed files removed because the service could not decode them
    pub rejected: usize,
    /// Renamed files kept without a caption
    pub unlabeled: usize,
}

/// Result of one pipeline run
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub record_id: Uuid,
    pub name: String,
    /// Terminal status the job ended in
    pub status: LabelStatus,
    /// Number of captions written to the manifest
    pub labeled: usize,
    /// Number of files that received a sequence number
    pub images: usize,
}

/// Runs the tagging stages for claimed datasets.
///
/// ```text
/// fetch ─▶ extract ─▶ label (filter/rename/caption) ─▶ manifest ─▶ repack ─▶ publish
/// ```
///
/// Any stage failure marks the record `Failed` and skips the remaining
/// stages. Local artifacts live in one scratch workspace per job, removed on
/// every exit path.
pub struct TaggingPipeline {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    captioner: Arc<dyn Captioner>,
    work_dir: Option<PathBuf>,
}

impl TaggingPipeline {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        metadata: Arc<dyn MetadataStore>,
        captioner: Arc<dyn Captioner>,
    ) -> Self {
        Self {
            blobs,
            metadata,
            captioner,
            work_dir: None,
        }
    }

    /// Create per-job workspaces under `dir` instead of the OS temp dir
    pub fn with_work_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.work_dir = dir;
        self
    }

    /// Run every stage for `record` (already `Processing`) and record the
    /// terminal status. Never returns an error: failures end as `Failed`.
    #[instrument(skip(self, record), fields(dataset = %record.name, id = %record.id))]
    pub async fn process(&self, record: &DatasetRecord) -> JobOutcome {
        let started = Instant::now();
        info!(blob_key = %record.blob_key, "Tagging dataset");

        let (status, report) = match self.run_stages(record).await {
            Ok(report) => {
                info!(
                    images = report.images,
                    labeled = report.labels.len(),
                    skipped = report.skipped,
                    unreadable = report.unreadable,
                    rejected = report.rejected,
                    unlabeled = report.unlabeled,
                    "Dataset tagged"
                );
                (LabelStatus::Done, report)
            }
            Err(e) => {
                error!(stage = %e.stage, error = %e.source, "Tagging failed");
                (LabelStatus::Failed, LabelingReport::default())
            }
        };

        if let Err(e) = self.metadata.set_status(record.id, status).await {
            error!(error = %e, status = ?status, "Failed to record job status");
        }

        match status {
            LabelStatus::Done => metrics::counter!("dataset.jobs.done").increment(1),
            _ => metrics::counter!("dataset.jobs.failed").increment(1),
        }
        metrics::histogram!("dataset.job.duration_seconds").record(started.elapsed().as_secs_f64());

        JobOutcome {
            record_id: record.id,
            name: record.name.clone(),
            status,
            labeled: report.labels.len(),
            images: report.images,
        }
    }

    async fn run_stages(&self, record: &DatasetRecord) -> Result<LabelingReport, PipelineError> {
        // Dropping the workspace deletes every path below it.
        let workspace = self
            .workspace()
            .map_err(|e| PipelineError::at(Stage::Fetch)(e.into()))?;

        let source_archive = workspace.path().join("source.zip");
        self.blobs
            .get(&record.blob_key, &source_archive)
            .await
            .map_err(PipelineError::at(Stage::Fetch))?;

        let extracted = workspace.path().join("extracted");
        {
            let (archive_path, dest) = (source_archive.clone(), extracted.clone());
            run_codec(move || archive::extract(&archive_path, &dest))
                .await
                .map_err(PipelineError::at(Stage::Extract))?;
        }

        let output = workspace
            .path()
            .join("output")
            .join(sanitize_path_component(&record.name));
        let report = label_images(&extracted, &output, &record.category, self.captioner.as_ref())
            .await
            .map_err(PipelineError::at(Stage::Label))?;

        if report.labels.is_empty() {
            return Err(PipelineError {
                stage: Stage::Label,
                source: DatasetError::NoCaptions {
                    images: report.images,
                },
            });
        }

        write_manifest(&output, &report.labels)
            .await
            .map_err(PipelineError::at(Stage::Manifest))?;

        let tagged_archive = workspace.path().join("tagged.zip");
        {
            let (src, archive_path) = (output.clone(), tagged_archive.clone());
            run_codec(move || archive::pack(&src, &archive_path))
                .await
                .map_err(PipelineError::at(Stage::Repack))?;
        }

        self.blobs
            .put(&record.blob_key, &tagged_archive)
            .await
            .map_err(PipelineError::at(Stage::Publish))?;

        Ok(report)
    }

    fn workspace(&self) -> io::Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("tagging-");
        match &self.work_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)
            }
            None => builder.tempdir(),
        }
    }
}

/// Rename, filter and caption every image under `source_dir` into `output_dir`.
///
/// Files are visited in lexicographic path order. Each readable image gets
/// the next 1-based sequence number and is written as `<00000n>.<ext>`;
/// non-images are left alone and unreadable images are deleted, and neither
/// consumes a number. A decode failure from the captioner removes the renamed
/// file; any other captioning failure or an empty caption leaves it in place
/// without a label.
pub async fn label_images(
    source_dir: &Path,
    output_dir: &Path,
    category: &str,
    captioner: &dyn Captioner,
) -> Result<LabelingReport, DatasetError> {
    tokio::fs::create_dir_all(output_dir).await?;

    let candidates = {
        let root = source_dir.to_path_buf();
        tokio::task::spawn_blocking(move || collect_files(&root))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
    };

    let mut report = LabelingReport::default();
    let mut next_seq: u32 = 1;

    for path in candidates {
        let Some(ext) = image_extension(&path) else {
            debug!(file = %path.display(), "Skipping non-image file");
            report.skipped += 1;
            continue;
        };

        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Unreadable image, deleting it");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(file = %path.display(), error = %e, "Failed to delete unreadable image");
                }
                report.unreadable += 1;
                continue;
            }
        };

        let file_name = format!("{:05}.{}", next_seq, ext);
        let renamed = output_dir.join(&file_name);
        if let Err(e) = tokio::fs::write(&renamed, &data).await {
            warn!(file = %renamed.display(), error = %e, "Failed to write renamed image");
            continue;
        }
        next_seq += 1;
        report.images += 1;

        match captioner.caption(&data, category, caption_format(&ext)).await {
            Ok(caption) if !caption.is_empty() => {
                metrics::counter!("dataset.images.captioned").increment(1);
                report.labels.insert(file_name, caption);
            }
            Ok(_) => {
                warn!(file = %file_name, "Empty caption, image left unlabeled");
                report.unlabeled += 1;
            }
            Err(e) if e.is_decode_failure() => {
                warn!(file = %file_name, error = %e, "Image rejected by captioner, removing it");
                metrics::counter!("dataset.images.rejected").increment(1);
                if let Err(e) = tokio::fs::remove_file(&renamed).await {
                    warn!(file = %file_name, error = %e, "Failed to remove rejected image");
                }
                report.rejected += 1;
            }
            Err(e) => {
                warn!(file = %file_name, error = %e, "Captioning failed, image left unlabeled");
                report.unlabeled += 1;
            }
        }
    }

    Ok(report)
}

/// Every non-directory entry under `root`, in lexicographic path order
fn collect_files(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "Failed to visit extracted entry");
                None
            }
        })
        .filter(|entry| !entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect()
}

/// Lower-cased extension when it names a supported image type
fn image_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    IMAGE_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// Format name sent to the captioning service
fn caption_format(ext: &str) -> &str {
    match ext {
        "jpg" => "jpeg",
        other => other,
    }
}

async fn write_manifest(
    output_dir: &Path,
    labels: &BTreeMap<String, String>,
) -> Result<(), DatasetError> {
    let body = serde_json::to_vec_pretty(labels).map_err(io::Error::from)?;
    tokio::fs::write(output_dir.join(MANIFEST_FILE), body).await?;
    Ok(())
}

/// Run a blocking archive operation off the async runtime
async fn run_codec<F>(f: F) -> Result<usize, DatasetError>
where
    F: FnOnce() -> Result<usize, CodecError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| DatasetError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?
        .map_err(DatasetError::from)
}
