use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::client::{ClientError, LeafEntry, LogClient, SignedTreeHead};

/// In continuous mode, how long to hold out for a full batch of new entries
/// before settling for any growth at all.
const STH_QUICK_WINDOW: Duration = Duration::from_secs(45);

/// Configuration for a [`Fetcher`].
#[derive(Debug, Clone)]
pub struct FetcherOptions {
    /// Maximum entries to request in one get-entries call.
    pub batch_size: usize,
    /// Number of concurrent fetch workers.
    pub parallel_fetch: usize,
    /// `[start_index, end_index)` is the entry range to fetch. An end of 0
    /// means "the tree size at startup".
    pub start_index: u64,
    pub end_index: u64,
    /// Keep following the log as it grows after reaching `end_index`.
    pub continuous: bool,
}

impl Default for FetcherOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            parallel_fetch: 1,
            start_index: 0,
            end_index: 0,
            continuous: false,
        }
    }
}

/// A contiguous range of fetched entries.
#[derive(Debug, Clone)]
pub struct EntryBatch {
    /// Index of the first entry in `entries`.
    pub start: u64,
    pub entries: Vec<LeafEntry>,
}

/// A range of entry indices to fetch in one request, both ends inclusive.
#[derive(Debug, Clone, Copy)]
struct FetchRange {
    start: u64,
    end: u64,
}

struct FetchState {
    end_index: u64,
    sth: Option<SignedTreeHead>,
    sth_backoff: Option<Backoff>,
}

/// Fetches a range of entries from a CT log through parallel workers,
/// tolerating rate limits, short responses, and (in continuous mode) a tree
/// that keeps growing. Batches are delivered to the callback out of order
/// across workers; each batch itself is contiguous.
pub struct Fetcher<C: LogClient> {
    uri: String,
    client: C,
    batch_size: u64,
    parallel_fetch: usize,
    start_index: u64,
    continuous: bool,
    state: Mutex<FetchState>,
    cancel: CancellationToken,
}

impl<C: LogClient> Fetcher<C> {
    pub fn new(client: C, opts: FetcherOptions) -> Self {
        Self {
            uri: client.base_uri().to_string(),
            batch_size: opts.batch_size as u64,
            parallel_fetch: opts.parallel_fetch.max(1),
            start_index: opts.start_index,
            continuous: opts.continuous,
            state: Mutex::new(FetchState {
                end_index: opts.end_index,
                sth: None,
                sth_backoff: None,
            }),
            cancel: CancellationToken::new(),
            client,
        }
    }

    /// Stops range generation. In-flight fetches complete and are delivered,
    /// then [`run`](Self::run) returns. Safe to call before or after `run`.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Caches the log's current STH if not already known and clamps the
    /// configured range to the tree size. Fatal on get-sth failure.
    pub async fn prepare(&self) -> Result<SignedTreeHead, ClientError> {
        let mut state = self.state.lock().await;
        if let Some(sth) = &state.sth {
            return Ok(sth.clone());
        }
        let sth = self.client.get_sth().await.inspect_err(|e| {
            tracing::error!(uri = %self.uri, error = %e, "get-sth failed");
        })?;
        tracing::debug!(uri = %self.uri, tree_size = sth.tree_size, "got STH");

        if state.end_index == 0 || state.end_index > sth.tree_size {
            tracing::debug!(
                uri = %self.uri,
                from = state.end_index,
                to = sth.tree_size,
                "clamped end index to tree size"
            );
            state.end_index = sth.tree_size;
        }
        state.sth = Some(sth.clone());
        Ok(sth)
    }

    /// Fetches the configured range, invoking `callback` for each batch.
    /// Returns once the range is exhausted (never, in continuous mode) or
    /// after [`stop`](Self::stop), when pending work has drained. Dropping
    /// the returned future aborts everything immediately.
    pub async fn run<F>(&self, callback: F) -> Result<(), ClientError>
    where
        F: Fn(EntryBatch) + Send + Sync,
    {
        tracing::debug!(uri = %self.uri, "starting fetcher");
        self.prepare().await?;

        let (ranges_tx, ranges_rx) = mpsc::channel::<FetchRange>(1);
        let ranges_rx = Arc::new(Mutex::new(ranges_rx));

        let generator = self.gen_ranges(ranges_tx);
        let workers = futures::future::join_all(
            (0..self.parallel_fetch).map(|idx| self.run_worker(idx, ranges_rx.clone(), &callback)),
        );
        tokio::join!(generator, workers);

        tracing::debug!(uri = %self.uri, "fetcher terminated");
        Ok(())
    }

    /// Single producer of fetch ranges. In continuous mode, reaching the end
    /// of the known tree triggers an STH wait instead of terminating.
    async fn gen_ranges(&self, ranges: mpsc::Sender<FetchRange>) {
        tracing::debug!(uri = %self.uri, "range generator starting");
        let mut start = self.start_index;
        let mut end = self.state.lock().await.end_index;

        while start < end || self.continuous {
            if start == end {
                // Implies continuous mode.
                if !self.update_sth().await {
                    tracing::warn!(uri = %self.uri, "stopping range generator");
                    return;
                }
                end = self.state.lock().await.end_index;
            }

            let batch_end = start + self.batch_size.min(end - start);
            let next = FetchRange {
                start,
                end: batch_end - 1,
            };
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::warn!(uri = %self.uri, "range generation cancelled");
                    return;
                }
                sent = ranges.send(next) => {
                    if sent.is_err() {
                        return;
                    }
                }
            }
            start = batch_end;
        }
        tracing::debug!(uri = %self.uri, "range generator finished");
    }

    /// Waits until the log's STH grows, then advances the end index. Holds
    /// out for a full batch of new entries while the quick window lasts, then
    /// settles for any growth. Returns false only when cancelled.
    async fn update_sth(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.sth_backoff.is_none() {
            state.sth_backoff = Some(Backoff::for_log_requests());
        }

        let last_size = state.end_index;
        let target_size = last_size + self.batch_size;
        let quick_deadline = Instant::now() + STH_QUICK_WINDOW;

        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            match self.client.get_sth().await {
                Err(e) => {
                    tracing::debug!(uri = %self.uri, error = %e, "get-sth failed while waiting for growth");
                }
                Ok(sth) => {
                    tracing::debug!(uri = %self.uri, tree_size = sth.tree_size, "got STH");
                    let quick = Instant::now() < quick_deadline;
                    if sth.tree_size > last_size && (!quick || sth.tree_size >= target_size) {
                        if quick {
                            // Growth is presumably fast; next pause restarts at the minimum.
                            state
                                .sth_backoff
                                .as_mut()
                                .expect("backoff initialized above")
                                .reset();
                        }
                        state.end_index = sth.tree_size;
                        state.sth = Some(sth);
                        return true;
                    }
                    tracing::debug!(
                        uri = %self.uri,
                        tree_size = sth.tree_size,
                        last = last_size,
                        target = target_size,
                        "waiting for bigger STH"
                    );
                }
            }
            let pause = state
                .sth_backoff
                .as_mut()
                .expect("backoff initialized above")
                .duration();
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Fetch worker: fully covers each range it takes, re-requesting when the
    /// log returns fewer entries than asked. Failed attempts back off and
    /// retry indefinitely; the backoff resets whenever progress is made.
    async fn run_worker<F>(
        &self,
        worker: usize,
        ranges: Arc<Mutex<mpsc::Receiver<FetchRange>>>,
        callback: &F,
    ) where
        F: Fn(EntryBatch) + Send + Sync,
    {
        tracing::debug!(uri = %self.uri, worker, "fetch worker starting");
        loop {
            let range = { ranges.lock().await.recv().await };
            let Some(mut range) = range else { break };

            let mut backoff = Backoff::for_log_requests();
            while range.start <= range.end {
                match self.client.get_raw_entries(range.start, range.end).await {
                    Err(e) => {
                        // 429s are routine when the log is pacing us.
                        if e.is_rate_limited() {
                            tracing::debug!(uri = %self.uri, worker, error = %e, "get-entries rate limited");
                        } else {
                            tracing::error!(uri = %self.uri, worker, error = %e, "get-entries failed");
                        }
                        tokio::time::sleep(backoff.duration()).await;
                    }
                    Ok(resp) if resp.entries.is_empty() => {
                        // An empty response makes no progress; treating it as
                        // success would spin on the same range forever.
                        tracing::warn!(uri = %self.uri, worker, start = range.start, "empty get-entries response");
                        tokio::time::sleep(backoff.duration()).await;
                    }
                    Ok(resp) => {
                        let count = resp.entries.len() as u64;
                        callback(EntryBatch {
                            start: range.start,
                            entries: resp.entries,
                        });
                        range.start += count;
                        backoff.reset();
                    }
                }
            }
        }
        tracing::debug!(uri = %self.uri, worker, "fetch worker finished");
    }
}
