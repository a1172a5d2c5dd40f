//! snowdrift-core: Shared components for the snowdrift loader.
//!
//! This crate contains the infrastructure the loader builds on:
//!
//! - `storage/` - Multi-cloud storage abstraction (S3, GCS, Azure, local)
//! - `metrics/` - Metric events and the optional Prometheus exporter
//! - `config/` - Environment variable interpolation and CLI arguments
//! - `error` - Common error types
//! - `tracing` - Subscriber setup that keeps stdout free for checkpoints

pub mod config;
pub mod error;
pub mod metrics;
pub mod storage;
pub mod tracing;

// Re-export commonly used items
pub use config::{CliArgs, InterpolationResult, interpolate, interpolate_with, read_interpolated};
pub use error::{ConfigError, MetricsError, StorageError};
pub use metrics::init_global as init_metrics;
pub use storage::{StorageProvider, StorageProviderRef};
pub use tracing::init_tracing;
