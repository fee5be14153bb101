use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;

use crate::cache::LockedMap;
use crate::cert::{Cert, CertChain, CertError, CertPool};
use crate::client::AddLogClient;
use crate::errors::{FixError, FixErrorKind};
use crate::hash::{hash_cert, hash_chain};
use crate::limiter::Limiter;
use crate::sync::WaitGroup;

/// Attempts made to fetch the accepted roots before giving up.
const ROOT_FETCH_ATTEMPTS: usize = 10;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("failed to get roots from log after repeated attempts: {0}")]
    Roots(crate::client::ClientError),

    #[error("cannot parse accepted root: {0}")]
    BadRoot(#[from] CertError),
}

struct PostTask {
    chain: CertChain,
}

#[derive(Default)]
struct LoggerCounters {
    active: AtomicU32,
    queued: AtomicU32,
    posted: AtomicU32,
    reposted: AtomicU32,
    chain_reposted: AtomicU32,
}

impl LoggerCounters {
    fn snapshot(&self) -> LoggerStats {
        LoggerStats {
            active: self.active.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            posted: self.posted.load(Ordering::Relaxed),
            reposted: self.reposted.load(Ordering::Relaxed),
            chain_reposted: self.chain_reposted.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of posting counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoggerStats {
    pub active: u32,
    pub queued: u32,
    pub posted: u32,
    pub reposted: u32,
    pub chain_reposted: u32,
}

#[derive(Clone)]
struct PostWorker {
    client: Arc<dyn AddLogClient>,
    limiter: Arc<dyn Limiter>,
    errors: mpsc::UnboundedSender<FixError>,
    post_cert_cache: Arc<LockedMap>,
    post_chain_cache: Arc<LockedMap>,
    counters: Arc<LoggerCounters>,
    wg: Arc<WaitGroup>,
}

/// Asynchronously posts verified chains to a CT log. Once a chain for a leaf
/// has been accepted, further chains for the same leaf are suppressed; a
/// chain that has already been attempted (by exact certificate sequence) is
/// never attempted again in this process.
pub struct Logger {
    to_post: mpsc::Sender<PostTask>,
    roots: Arc<CertPool>,
    post_cert_cache: Arc<LockedMap>,
    post_chain_cache: Arc<LockedMap>,
    counters: Arc<LoggerCounters>,
    wg: Arc<WaitGroup>,
}

impl Logger {
    /// Fetches the log's accepted roots (with bounded retry) and starts
    /// `worker_count` post workers. A root that does not parse is fatal: a
    /// trust set of unknown content is not worth running against.
    pub async fn new(
        worker_count: usize,
        errors: mpsc::UnboundedSender<FixError>,
        client: Arc<dyn AddLogClient>,
        limiter: Arc<dyn Limiter>,
        log_stats: bool,
    ) -> Result<Self, LoggerError> {
        let roots = Arc::new(fetch_roots(client.as_ref()).await?);
        tracing::info!(roots = roots.len(), "fetched accepted roots from log");

        let (to_post, tasks) = mpsc::channel(1);
        let tasks = Arc::new(Mutex::new(tasks));
        let counters = Arc::new(LoggerCounters::default());
        let wg = Arc::new(WaitGroup::new());
        let post_cert_cache = Arc::new(LockedMap::new());
        let post_chain_cache = Arc::new(LockedMap::new());

        let worker = PostWorker {
            client,
            limiter,
            errors,
            post_cert_cache: post_cert_cache.clone(),
            post_chain_cache: post_chain_cache.clone(),
            counters: counters.clone(),
            wg: wg.clone(),
        };
        for idx in 0..worker_count {
            tokio::spawn(post_server(idx, tasks.clone(), worker.clone()));
        }
        if log_stats {
            spawn_stats(&counters);
        }

        Ok(Self {
            to_post,
            roots,
            post_cert_cache,
            post_chain_cache,
            counters,
            wg,
        })
    }

    /// The roots the log accepts.
    pub fn root_certs(&self) -> Arc<CertPool> {
        self.roots.clone()
    }

    /// Whether a chain for this certificate has already been accepted by the
    /// log through this Logger.
    pub fn is_posted(&self, cert: &Cert) -> bool {
        self.post_cert_cache.get(hash_cert(cert))
    }

    /// Queues a chain (leaf first) for posting. Suppressed if a chain for the
    /// leaf already succeeded, or if this exact chain was already attempted.
    /// The attempt cache is written eagerly so racing duplicates cannot both
    /// enqueue. Blocks while all workers are busy.
    pub async fn queue_chain(&self, chain: CertChain) {
        if chain.is_empty() {
            return;
        }

        let leaf_hash = hash_cert(&chain[0]);
        if self.post_cert_cache.get(leaf_hash) {
            self.counters.reposted.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // All chains for one leaf are not interchangeable: a log may refuse
        // one chain and accept another, so each unique chain gets a try.
        let chain_hash = hash_chain(&chain);
        if self.post_chain_cache.get(chain_hash) {
            self.counters.chain_reposted.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.post_chain_cache.set(chain_hash, true);

        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        self.wg.add(1);
        if self.to_post.send(PostTask { chain }).await.is_err() {
            self.wg.done();
            tracing::warn!("post queue closed, dropping chain");
        }
    }

    /// Blocks until every queued post has completed.
    pub async fn wait(&self) {
        self.wg.wait().await;
    }

    pub fn stats(&self) -> LoggerStats {
        self.counters.snapshot()
    }
}

async fn fetch_roots(client: &dyn AddLogClient) -> Result<CertPool, LoggerError> {
    let mut last_err = None;
    for attempt in 1..=ROOT_FETCH_ATTEMPTS {
        match client.get_accepted_roots().await {
            Ok(ders) => {
                let mut pool = CertPool::new();
                for der in ders {
                    pool.add_cert(Cert::from_der(der)?);
                }
                return Ok(pool);
            }
            Err(e) => {
                tracing::warn!(attempt, error = %e, "get-roots failed");
                last_err = Some(e);
            }
        }
    }
    Err(LoggerError::Roots(
        last_err.expect("at least one attempt was made"),
    ))
}

async fn post_server(worker: usize, tasks: Arc<Mutex<mpsc::Receiver<PostTask>>>, w: PostWorker) {
    tracing::debug!(worker, "post worker starting");
    loop {
        let task = { tasks.lock().await.recv().await };
        let Some(task) = task else { break };
        w.counters.active.fetch_add(1, Ordering::Relaxed);
        post_chain(&w, task).await;
        w.counters.active.fetch_sub(1, Ordering::Relaxed);
        w.wg.done();
    }
    tracing::debug!(worker, "post worker finished");
}

async fn post_chain(w: &PostWorker, task: PostTask) {
    // Another worker may have landed a chain for this leaf since we queued.
    let leaf_hash = hash_cert(&task.chain[0]);
    if w.post_cert_cache.get(leaf_hash) {
        w.counters.reposted.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let der_chain: Vec<Vec<u8>> = task.chain.iter().map(|c| c.raw().to_vec()).collect();

    w.limiter.wait().await;
    w.counters.posted.fetch_add(1, Ordering::Relaxed);
    match w.client.add_chain(&der_chain).await {
        Ok(_sct) => {
            tracing::debug!(leaf = %hex::encode(&leaf_hash[..8]), "chain accepted by log");
            w.post_cert_cache.set(leaf_hash, true);
        }
        Err(e) => {
            let err = FixError::new(FixErrorKind::LogPostFailed, format!("add-chain failed: {e}"))
                .with_chain(task.chain);
            if w.errors.send(err).is_err() {
                tracing::warn!("error channel closed, dropping post error");
            }
        }
    }
}

fn spawn_stats(counters: &Arc<LoggerCounters>) {
    let counters = Arc::downgrade(counters);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let Some(counters) = counters.upgrade() else {
                break;
            };
            let s = counters.snapshot();
            tracing::info!(
                active = s.active,
                posted = s.posted,
                queued = s.queued,
                certs_requeued = s.reposted,
                chains_requeued = s.chain_reposted,
                "posters"
            );
        }
    });
}
