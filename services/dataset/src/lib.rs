//! Dataset Service
//!
//! Stores versioned image-dataset archives and captions them in the
//! background. Clients upload a zip archive under a unique name; the archive
//! goes to S3 and a `Pending` record goes to PostgreSQL. A tagging scheduler
//! claims pending records one at a time, captions every image through an
//! external captioning service, and replaces the archive in place with a
//! renamed, labeled copy.
//!
//! ## Architecture
//!
//! ```text
//!  HTTP API                  PostgreSQL                 S3 Bucket
//! ┌──────────────┐          ┌──────────────┐          ┌──────────────┐
//! │ upload/list/ │─────────▶│ dataset_     │          │ <prefix>/    │
//! │ download/    │          │ records      │          │   <name>.zip │
//! │ delete       │─────────────────────────────────────▶│              │
//! └──────────────┘          └──────────────┘          └──────────────┘
//!                                  ▲ claim                    ▲
//!                                  │                          │ fetch/publish
//!                           ┌──────────────┐          ┌──────────────┐
//!                           │ Tagging      │─────────▶│ Tagging      │
//!                           │ Scheduler    │          │ Pipeline     │
//!                           └──────────────┘          └──────────────┘
//!                                                            │
//!                                                            ▼
//!                                                     ┌──────────────┐
//!                                                     │ Captioning   │
//!                                                     │ Service      │
//!                                                     └──────────────┘
//! ```
//!
//! ## Status lifecycle
//!
//! `Pending(0) -> Processing(2) -> {Done(1), Failed(-1)}`. Only the claim
//! moves a record out of `Pending`, and failed jobs are never retried.

pub mod api;
pub mod archive;
pub mod blob_store;
pub mod captioning;
pub mod config;
pub mod datasets;
pub mod error;
pub mod metadata_store;
pub mod models;
pub mod pipeline;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod testing;

pub use blob_store::{BlobStore, S3BlobStore};
pub use captioning::{CaptionError, Captioner, CaptioningClient};
pub use config::Config;
pub use datasets::DatasetService;
pub use error::{DatasetError, Result};
pub use metadata_store::{MetadataStore, PgMetadataStore};
pub use models::{DatasetQuery, DatasetRecord, LabelStatus};
pub use pipeline::{JobOutcome, TaggingPipeline};
pub use scheduler::TaggingScheduler;
