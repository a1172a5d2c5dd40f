//! Flush coordination.
//!
//! Decides when buffered streams are flushed, runs each round as a fork-join
//! over the materializer and moves the checkpoint forward only for streams
//! whose rows were committed.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use indexmap::IndexMap;
use serde_json::Value;
use snafu::prelude::*;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use snowdrift_core::emit;

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::error::{CheckpointEncodeSnafu, FlushError, LoaderError, OutputSnafu};
use crate::flatten::FlatRecord;
use crate::materializer::{BatchJob, FlushJob, Materializer};
use crate::metrics::events::{CheckpointEmitted, FlushRoundCompleted, RecordsBuffered};
use crate::stream::StreamState;
use crate::warehouse::LoadCounts;

#[derive(Debug, Clone)]
pub struct FlushSettings {
    pub batch_size_rows: usize,
    /// Configured parallelism, `0` meaning auto.
    pub parallelism: usize,
    pub max_parallelism: usize,
    pub flush_all_streams: bool,
    /// Uploads go through a table stage and cannot run concurrently.
    pub table_stage: bool,
}

impl FlushSettings {
    pub fn from_config(config: &Config, table_stage: bool) -> Self {
        Self {
            batch_size_rows: config.batch_size_rows,
            parallelism: config.parallelism,
            max_parallelism: config.max_parallelism,
            flush_all_streams: config.flush_all_streams,
            table_stage,
        }
    }
}

/// Which checkpoint rule a round applies on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    PerStream,
    Global,
}

pub struct Coordinator<W> {
    materializer: Arc<Materializer>,
    settings: FlushSettings,
    streams: IndexMap<String, StreamState>,
    /// Streams whose row counter reached `batch_size_rows`, in arrival order.
    queued: Vec<String>,
    pending_batches: Vec<BatchJob>,
    checkpoint: Checkpoint,
    output: W,
}

impl<W: AsyncWrite + Unpin + Send> Coordinator<W> {
    pub fn new(materializer: Arc<Materializer>, mut settings: FlushSettings, output: W) -> Self {
        if settings.table_stage && settings.parallelism != 1 {
            warn!(
                parallelism = settings.parallelism,
                "Table stages do not support concurrent uploads, using parallelism 1"
            );
            settings.parallelism = 1;
        }
        Self {
            materializer,
            settings,
            streams: IndexMap::new(),
            queued: Vec::new(),
            pending_batches: Vec::new(),
            checkpoint: Checkpoint::default(),
            output,
        }
    }

    pub fn stream(&self, name: &str) -> Option<&StreamState> {
        self.streams.get(name)
    }

    /// Install (or replace) the state of a stream. Any rows of a replaced
    /// state must have been flushed first.
    pub fn set_stream(&mut self, name: &str, state: StreamState) {
        self.queued.retain(|queued| queued != name);
        self.streams.insert(name.to_string(), state);
    }

    pub fn on_state(&mut self, value: Value) {
        let held = self.uncommitted_streams();
        let held: Vec<&str> = held.iter().map(String::as_str).collect();
        self.checkpoint.on_state(value, &held);
    }

    /// Streams with buffered rows or a `BATCH` file not loaded yet.
    fn uncommitted_streams(&self) -> Vec<String> {
        let mut streams = self.streams_with_rows();
        for job in &self.pending_batches {
            if !streams.contains(&job.message.stream) {
                streams.push(job.message.stream.clone());
            }
        }
        streams
    }

    fn pending_batch_streams(&self) -> Vec<String> {
        self.pending_batches
            .iter()
            .map(|job| job.message.stream.clone())
            .collect()
    }

    /// Buffer a transformed row and run a round when the triggers fire.
    pub async fn buffer(
        &mut self,
        stream: &str,
        key: Option<String>,
        row: FlatRecord,
    ) -> Result<(), LoaderError> {
        let Some(state) = self.streams.get_mut(stream) else {
            return Ok(());
        };
        state.buffer(key, row);
        emit!(RecordsBuffered {
            stream: stream.to_string(),
            count: 1,
        });

        if state.row_count >= self.settings.batch_size_rows && !self.queued.iter().any(|q| q == stream) {
            debug!(stream = %stream, rows = state.row_count, "Stream reached batch size");
            self.queued.push(stream.to_string());
        }
        self.maybe_flush().await
    }

    async fn maybe_flush(&mut self) -> Result<(), LoaderError> {
        if self.queued.is_empty() {
            return Ok(());
        }

        if self.settings.flush_all_streams {
            let selection = self.streams_with_rows();
            self.flush_round(selection, Branch::Global).await?;
            return self.emit().await;
        }

        if self.queued.len() >= self.round_threshold() {
            let selection = self.queued.clone();
            self.flush_round(selection, Branch::PerStream).await?;
            return self.emit().await;
        }
        Ok(())
    }

    /// Number of queued streams that triggers a per-stream round.
    fn round_threshold(&self) -> usize {
        match self.settings.parallelism {
            0 => 1,
            p => p.min(self.streams.len()).max(1),
        }
    }

    /// Workers for a round of `jobs` flushes.
    fn effective_parallelism(&self, jobs: usize) -> usize {
        match self.settings.parallelism {
            0 => jobs.min(self.settings.max_parallelism).max(1),
            p => p,
        }
    }

    fn batch_threshold(&self) -> usize {
        self.settings.parallelism.max(1)
    }

    fn streams_with_rows(&self) -> Vec<String> {
        self.streams
            .iter()
            .filter(|(_, state)| state.has_rows())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Flush the selected streams concurrently, then clear them and move
    /// the checkpoint forward. Nothing is cleared when any flush fails.
    async fn flush_round(&mut self, selection: Vec<String>, branch: Branch) -> Result<(), FlushError> {
        let jobs: Vec<FlushJob> = selection
            .iter()
            .filter_map(|name| {
                let state = self.streams.get(name)?;
                state.has_rows().then(|| FlushJob::snapshot(name, state))
            })
            .collect();

        let start = Instant::now();
        let count = jobs.len();
        if count > 0 {
            let workers = self.effective_parallelism(count);
            info!(streams = count, workers, "Flushing streams");
            let materializer = self.materializer.clone();
            run_all(jobs, workers, |job| {
                let materializer = materializer.clone();
                async move { materializer.flush(job).await }
            })
            .await?;
        }

        for name in &selection {
            if let Some(state) = self.streams.get_mut(name) {
                state.clear();
            }
        }
        self.queued.retain(|queued| !selection.contains(queued));

        // A pending batch holds back the bookmark of its stream.
        let pending = self.pending_batch_streams();
        match branch {
            Branch::PerStream => {
                let committed: Vec<&String> = selection.iter().filter(|name| !pending.contains(name)).collect();
                self.checkpoint.advance_streams(&committed);
            }
            Branch::Global => {
                let held: Vec<&str> = pending.iter().map(String::as_str).collect();
                self.checkpoint.advance_all(&held);
            }
        }

        emit!(FlushRoundCompleted {
            streams: count,
            duration: start.elapsed(),
        });
        Ok(())
    }

    /// Flush a single stream before its schema changes.
    pub async fn flush_stream(&mut self, name: &str) -> Result<(), LoaderError> {
        self.flush_round(vec![name.to_string()], Branch::PerStream).await?;
        self.emit().await
    }

    /// Queue a `BATCH` file and run a batch round when enough are pending.
    pub async fn queue_batch(&mut self, job: BatchJob) -> Result<(), LoaderError> {
        self.pending_batches.push(job);
        if self.settings.flush_all_streams || self.pending_batches.len() >= self.batch_threshold() {
            self.flush_batches().await?;
            return self.emit().await;
        }
        Ok(())
    }

    async fn flush_batches(&mut self) -> Result<(), FlushError> {
        if self.pending_batches.is_empty() {
            return Ok(());
        }
        let jobs = std::mem::take(&mut self.pending_batches);
        let mut streams: Vec<String> = jobs.iter().map(|job| job.message.stream.clone()).collect();
        streams.sort();
        streams.dedup();

        let start = Instant::now();
        let count = jobs.len();
        let workers = self.effective_parallelism(count);
        info!(batches = count, workers, "Loading batch files");
        let materializer = self.materializer.clone();
        run_all(jobs, workers, |job| {
            let materializer = materializer.clone();
            async move { materializer.flush_batch(job).await }
        })
        .await?;

        // Streamed rows still buffered for a stream hold its bookmark back.
        let committed: Vec<&String> = streams
            .iter()
            .filter(|name| self.streams.get(*name).is_none_or(|state| !state.has_rows()))
            .collect();
        self.checkpoint.advance_streams(&committed);

        emit!(FlushRoundCompleted {
            streams: count,
            duration: start.elapsed(),
        });
        Ok(())
    }

    /// Flush everything at end of input and write the final checkpoint.
    pub async fn finish(&mut self) -> Result<(), LoaderError> {
        let selection = self.streams_with_rows();
        if !selection.is_empty() {
            self.flush_round(selection, Branch::PerStream).await?;
        }
        self.flush_batches().await?;
        self.checkpoint.advance_all(&[]);
        self.emit().await
    }

    /// Write the flushed checkpoint when it changed since the last write.
    async fn emit(&mut self) -> Result<(), LoaderError> {
        let Some(value) = self.checkpoint.take_emission() else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(&value).context(CheckpointEncodeSnafu)?;
        line.push(b'\n');
        self.output.write_all(&line).await.context(OutputSnafu)?;
        self.output.flush().await.context(OutputSnafu)?;
        debug!(checkpoint = %value, "Emitted checkpoint");
        emit!(CheckpointEmitted);
        Ok(())
    }
}

/// Run `flush` over every job with at most `workers` in flight. Every job
/// runs to completion before the first error is returned.
async fn run_all<J, F, Fut>(jobs: Vec<J>, workers: usize, flush: F) -> Result<(), FlushError>
where
    F: FnMut(J) -> Fut,
    Fut: Future<Output = Result<LoadCounts, FlushError>>,
{
    let results: Vec<_> = futures::stream::iter(jobs)
        .map(flush)
        .buffer_unordered(workers)
        .collect()
        .await;
    for result in results {
        result?;
    }
    Ok(())
}
