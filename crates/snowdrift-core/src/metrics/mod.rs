//! Metrics plumbing.
//!
//! - `events`: the `InternalEvent` trait and storage events
//! - `init_global`: optional Prometheus scrape endpoint

pub mod events;

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;
use snafu::prelude::*;
use tracing::info;

use crate::error::{AddressParseSnafu, MetricsError, PrometheusInitSnafu};

/// Histogram buckets for duration metrics, in seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0,
];

/// Emit an internal event.
///
/// ```ignore
/// use snowdrift_core::emit;
/// use snowdrift_core::metrics::events::{RequestStatus, StorageOperation, StorageRequest};
///
/// emit!(StorageRequest { operation: StorageOperation::Put, status: RequestStatus::Success });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}

pub use emit;

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
///
/// Must be called from inside a tokio runtime.
pub fn init_global(addr: &str) -> Result<(), MetricsError> {
    let addr: SocketAddr = addr.parse().context(AddressParseSnafu)?;

    PrometheusBuilder::new()
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .with_http_listener(addr)
        .install()
        .context(PrometheusInitSnafu)?;

    info!(%addr, "Metrics endpoint started");
    Ok(())
}
