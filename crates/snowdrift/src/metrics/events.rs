//! Internal events for loader metrics emission.
//!
//! ## Stream Labels
//!
//! Per-stream metrics carry a `stream` label with the input stream name
//! (e.g., `"public-orders"`).

use std::time::Duration;

use metrics::{counter, histogram};
use tracing::trace;

pub use snowdrift_core::metrics::events::InternalEvent;

// ============================================================================
// Buffering events
// ============================================================================

/// Event emitted when a record is added to a stream bucket.
pub struct RecordsBuffered {
    pub stream: String,
    pub count: u64,
}

impl InternalEvent for RecordsBuffered {
    fn emit(self) {
        counter!("snowdrift_records_buffered_total", "stream" => self.stream).increment(self.count);
    }
}

// ============================================================================
// Flush events
// ============================================================================

/// Event emitted when a bulk load finishes.
pub struct RowsLoaded {
    pub stream: String,
    pub inserted: u64,
    pub updated: u64,
}

impl InternalEvent for RowsLoaded {
    fn emit(self) {
        trace!(stream = %self.stream, inserted = self.inserted, updated = self.updated, "Rows loaded");
        counter!("snowdrift_rows_inserted_total", "stream" => self.stream.clone()).increment(self.inserted);
        counter!("snowdrift_rows_updated_total", "stream" => self.stream).increment(self.updated);
    }
}

/// Event emitted when one stream (or batch file) has been flushed.
pub struct StreamFlushCompleted {
    pub stream: String,
    pub duration: Duration,
}

impl InternalEvent for StreamFlushCompleted {
    fn emit(self) {
        histogram!("snowdrift_stream_flush_duration_seconds", "stream" => self.stream)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a flush round has joined all of its workers.
pub struct FlushRoundCompleted {
    pub streams: usize,
    pub duration: Duration,
}

impl InternalEvent for FlushRoundCompleted {
    fn emit(self) {
        trace!(streams = self.streams, duration_ms = self.duration.as_millis(), "Flush round completed");
        counter!("snowdrift_flush_rounds_total").increment(1);
        histogram!("snowdrift_flush_round_streams").record(self.streams as f64);
        histogram!("snowdrift_flush_round_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a checkpoint line is written.
pub struct CheckpointEmitted;

impl InternalEvent for CheckpointEmitted {
    fn emit(self) {
        counter!("snowdrift_checkpoints_emitted_total").increment(1);
    }
}

// ============================================================================
// Warehouse events
// ============================================================================

/// Event emitted for every DDL statement issued by the table synchronizer.
pub struct DdlExecuted {
    pub kind: &'static str,
}

impl InternalEvent for DdlExecuted {
    fn emit(self) {
        counter!("snowdrift_ddl_statements_total", "kind" => self.kind).increment(1);
    }
}

pub struct WarehouseRequest {
    pub success: bool,
}

impl InternalEvent for WarehouseRequest {
    fn emit(self) {
        let status = if self.success { "success" } else { "failure" };
        counter!("snowdrift_warehouse_requests_total", "status" => status).increment(1);
    }
}

pub struct WarehouseRequestDuration {
    pub duration: Duration,
}

impl InternalEvent for WarehouseRequestDuration {
    fn emit(self) {
        histogram!("snowdrift_warehouse_request_duration_seconds").record(self.duration.as_secs_f64());
    }
}
