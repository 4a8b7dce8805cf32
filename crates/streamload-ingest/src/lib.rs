//! Streamload Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads heterogeneous spreadsheet and CSV exports of stream-monitoring data
//! into a normalized store without losing a row silently.
//!
//! # Stages
//!
//! - **Sources** ([`source`]): workbook and CSV readers yielding raw rows
//! - **Mapping** ([`mapping`]): raw column names to canonical field names
//! - **Quality** ([`quality`]): typed coercion and quality classification
//! - **Keys** ([`keys`]): business keys, alias tables, in-run merging
//! - **Integrity** ([`integrity`]): foreign keys against loaded parents
//! - **Loading** ([`loader`]): chunked, checkpointed upserts into a [`store`]
//! - **Quarantine** ([`quarantine`]): durable notes for rejected records
//!
//! # Example
//!
//! ```no_run
//! use streamload_ingest::{Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load("config/streamwatch.toml")?;
//!     let pipeline = Pipeline::builder(config).build().await?;
//!     let report = pipeline.run_configured().await?;
//!     println!("{}", report);
//!     std::process::exit(report.exit_code());
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod error;
pub mod integrity;
pub mod keys;
pub mod loader;
pub mod mapping;
pub mod pipeline;
pub mod quality;
pub mod quarantine;
pub mod report;
pub mod source;
pub mod store;
pub mod types;

pub use config::PipelineConfig;
pub use error::{IngestError, Result};
pub use pipeline::Pipeline;
pub use report::{LoadReport, RunReport};
