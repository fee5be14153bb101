use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;

use crate::cache::LockedMap;
use crate::cert::{dedup_certs, Cert, CertChain, CertPool};
use crate::errors::{FixError, FixErrorKind};
use crate::hash::{hash_bag, hash_cert, hash_chain, HASH_SIZE};
use crate::sync::WaitGroup;
use crate::url_cache::UrlCache;
use crate::verify::ChainVerifier;

/// How many AIA hops away from the material at hand the fixer will explore
/// before giving up on a leaf.
pub const MAX_AIA_DEPTH: usize = 20;

/// One queued fix attempt: a leaf, its deduplicated hinted chain, and the
/// roots any repaired path must terminate in.
struct FixTask {
    cert: Arc<Cert>,
    chain: Vec<Arc<Cert>>,
    roots: Arc<CertPool>,
}

#[derive(Default)]
struct FixerCounters {
    active: AtomicU32,
    reconstructed: AtomicU32,
    not_reconstructed: AtomicU32,
    fixed: AtomicU32,
    not_fixed: AtomicU32,
}

impl FixerCounters {
    /// Buckets one finished task by the errors it produced: no VerifyFailed
    /// means the hinted chain was enough; otherwise the task needed fixing,
    /// and FixFailed decides which way that went.
    fn update(&self, errors: &[FixError]) {
        let verify_failed = errors.iter().any(|e| e.kind == FixErrorKind::VerifyFailed);
        let fix_failed = errors.iter().any(|e| e.kind == FixErrorKind::FixFailed);
        if !verify_failed {
            self.reconstructed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.not_reconstructed.fetch_add(1, Ordering::Relaxed);
            if fix_failed {
                self.not_fixed.fetch_add(1, Ordering::Relaxed);
            } else {
                self.fixed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> FixerStats {
        FixerStats {
            active: self.active.load(Ordering::Relaxed),
            reconstructed: self.reconstructed.load(Ordering::Relaxed),
            not_reconstructed: self.not_reconstructed.load(Ordering::Relaxed),
            fixed: self.fixed.load(Ordering::Relaxed),
            not_fixed: self.not_fixed.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of fixer outcome counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixerStats {
    pub active: u32,
    pub reconstructed: u32,
    pub not_reconstructed: u32,
    pub fixed: u32,
    pub not_fixed: u32,
}

#[derive(Clone)]
struct WorkerContext {
    chains: mpsc::Sender<CertChain>,
    errors: mpsc::UnboundedSender<FixError>,
    cache: Arc<UrlCache>,
    verifier: Arc<ChainVerifier>,
    emitted: Arc<LockedMap>,
    counters: Arc<FixerCounters>,
    wg: Arc<WaitGroup>,
}

/// Repairs certificate chains. Workers take leaves off an internal queue, try
/// to verify the hinted chain, fall back to chasing AIA pointers, and push
/// every distinct verified chain to the `chains` channel and every failure to
/// the `errors` channel.
pub struct Fixer {
    to_fix: std::sync::Mutex<Option<mpsc::Sender<FixTask>>>,
    wg: Arc<WaitGroup>,
    counters: Arc<FixerCounters>,
}

impl Fixer {
    /// Starts `worker_count` fix workers. `http_client` is used for AIA
    /// fetches (behind the process-wide URL cache); `log_stats` enables a
    /// once-per-second counter line.
    pub fn new(
        worker_count: usize,
        chains: mpsc::Sender<CertChain>,
        errors: mpsc::UnboundedSender<FixError>,
        http_client: reqwest::Client,
        log_stats: bool,
    ) -> Self {
        let (to_fix, tasks) = mpsc::channel(1);
        let tasks = Arc::new(Mutex::new(tasks));
        let counters = Arc::new(FixerCounters::default());
        let wg = Arc::new(WaitGroup::new());
        let ctx = WorkerContext {
            chains,
            errors,
            cache: Arc::new(UrlCache::new(http_client)),
            verifier: Arc::new(ChainVerifier::new()),
            emitted: Arc::new(LockedMap::new()),
            counters: counters.clone(),
            wg: wg.clone(),
        };

        for worker in 0..worker_count {
            tokio::spawn(fix_server(worker, tasks.clone(), ctx.clone()));
        }
        if log_stats {
            spawn_stats(&counters);
        }

        Self {
            to_fix: std::sync::Mutex::new(Some(to_fix)),
            wg,
            counters,
        }
    }

    /// Queues a leaf and its hinted chain for fixing against `roots`. The
    /// hint is deduplicated (order preserved) and stripped of the leaf before
    /// it is handed to a worker. Blocks while all workers are busy.
    pub async fn queue_chain(&self, cert: Arc<Cert>, chain: &[Arc<Cert>], roots: Arc<CertPool>) {
        let deduped = dedup_hinted_chain(&cert, chain);
        let Some(sender) = self
            .to_fix
            .lock()
            .expect("fixer queue poisoned")
            .clone()
        else {
            tracing::warn!("fixer is shut down, dropping chain");
            return;
        };
        self.wg.add(1);
        if sender
            .send(FixTask {
                cert,
                chain: deduped,
                roots,
            })
            .await
            .is_err()
        {
            self.wg.done();
            tracing::warn!("fix queue closed, dropping chain");
        }
    }

    /// Blocks until every queued fix task has completed.
    pub async fn wait(&self) {
        self.wg.wait().await;
    }

    /// Closes the input queue; workers exit once it drains, which in turn
    /// closes the chains channel they hold.
    pub(crate) fn close(&self) {
        self.to_fix.lock().expect("fixer queue poisoned").take();
    }

    pub fn stats(&self) -> FixerStats {
        self.counters.snapshot()
    }
}

fn spawn_stats(counters: &Arc<FixerCounters>) {
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
                reconstructed = s.reconstructed,
                not_reconstructed = s.not_reconstructed,
                fixed = s.fixed,
                not_fixed = s.not_fixed,
                "fixers"
            );
        }
    });
}

fn dedup_hinted_chain(leaf: &Cert, chain: &[Arc<Cert>]) -> Vec<Arc<Cert>> {
    let leaf_hash = hash_cert(leaf);
    dedup_certs(chain)
        .into_iter()
        .filter(|c| hash_cert(c) != leaf_hash)
        .collect()
}

async fn fix_server(worker: usize, tasks: Arc<Mutex<mpsc::Receiver<FixTask>>>, ctx: WorkerContext) {
    tracing::debug!(worker, "fix worker starting");
    loop {
        let task = { tasks.lock().await.recv().await };
        let Some(task) = task else { break };
        ctx.counters.active.fetch_add(1, Ordering::Relaxed);
        fix_one(&ctx, task).await;
        ctx.counters.active.fetch_sub(1, Ordering::Relaxed);
        ctx.wg.done();
    }
    tracing::debug!(worker, "fix worker finished");
}

async fn fix_one(ctx: &WorkerContext, task: FixTask) {
    let (chains, errors) = handle_chain(ctx, &task).await;
    ctx.counters.update(&errors);
    for err in errors {
        if ctx.errors.send(err).is_err() {
            tracing::warn!("error channel closed, dropping fix error");
        }
    }
    for chain in remove_super_chains(chains) {
        let h = hash_chain(&chain);
        if ctx.emitted.get(h) {
            continue;
        }
        ctx.emitted.set(h, true);
        tracing::debug!(chain = %hex::encode(&h[..8]), len = chain.len(), "emitting fixed chain");
        if ctx.chains.send(chain).await.is_err() {
            tracing::warn!("chains channel closed, dropping fixed chain");
        }
    }
}

/// Tries the hinted chain first, then AIA expansion. Returns the verified
/// chains (roots stripped) and the task's errors, deduplicated by kind.
async fn handle_chain(ctx: &WorkerContext, task: &FixTask) -> (Vec<CertChain>, Vec<FixError>) {
    let mut intermediates = CertPool::from_certs(task.chain.iter().cloned());

    let chains = construct_chains(ctx, &task.cert, &intermediates, &task.roots).await;
    if !chains.is_empty() {
        return (chains, Vec::new());
    }

    let mut errors = vec![FixError::new(
        FixErrorKind::VerifyFailed,
        "no path to a trusted root with the supplied chain",
    )
    .with_cert(task.cert.clone())
    .with_chain(task.chain.clone())];

    match fix_chain(ctx, task, &mut intermediates, &mut errors).await {
        Some(chains) => (chains, dedup_errors(errors)),
        None => {
            errors.push(
                FixError::new(
                    FixErrorKind::FixFailed,
                    "AIA expansion exhausted without finding a path",
                )
                .with_cert(task.cert.clone())
                .with_chain(task.chain.clone()),
            );
            (Vec::new(), dedup_errors(errors))
        }
    }
}

/// Verified paths for `leaf` with the trailing trust-pool certificate
/// removed. Logs do not want the root in the submitted chain; a leaf that is
/// itself trusted stays a single-cert chain.
async fn construct_chains(
    ctx: &WorkerContext,
    leaf: &Arc<Cert>,
    intermediates: &CertPool,
    roots: &CertPool,
) -> Vec<CertChain> {
    ctx.verifier
        .build_paths(leaf, intermediates, roots)
        .await
        .into_iter()
        .map(|mut path| {
            let last = path.last().expect("paths are never empty");
            if path.len() > 1 && roots.includes(last) {
                path.pop();
            }
            path
        })
        .collect()
}

/// Walks outward from the leaf and its hint, fetching AIA `CA Issuers`
/// material and retrying verification after each new certificate. Fetch and
/// parse failures are recorded and the branch abandoned.
async fn fix_chain(
    ctx: &WorkerContext,
    task: &FixTask,
    intermediates: &mut CertPool,
    errors: &mut Vec<FixError>,
) -> Option<Vec<CertChain>> {
    let mut frontier: VecDeque<(Arc<Cert>, usize)> = VecDeque::new();
    frontier.push_back((task.cert.clone(), 0));
    for cert in &task.chain {
        frontier.push_back((cert.clone(), 1));
    }
    let mut explored: HashSet<[u8; HASH_SIZE]> = HashSet::new();

    while let Some((cert, depth)) = frontier.pop_front() {
        if depth >= MAX_AIA_DEPTH {
            continue;
        }
        if !explored.insert(hash_cert(&cert)) {
            continue;
        }
        for url in cert.ca_issuer_urls() {
            let body = match ctx.cache.get(&url).await {
                Ok(body) => body,
                Err(e) => {
                    errors.push(
                        FixError::new(e.kind(), e.to_string())
                            .with_cert(task.cert.clone())
                            .with_chain(task.chain.clone())
                            .with_url(&url),
                    );
                    continue;
                }
            };
            let issuer = match parse_cert_bytes(&body) {
                Ok(issuer) => issuer,
                Err(reason) => {
                    errors.push(
                        FixError::new(FixErrorKind::ParseFailure, reason)
                            .with_cert(task.cert.clone())
                            .with_chain(task.chain.clone())
                            .with_url(&url)
                            .with_bad(body.to_vec()),
                    );
                    continue;
                }
            };
            tracing::debug!(url, issuer = issuer.subject(), "fetched candidate issuer");
            intermediates.add_cert(issuer.clone());
            frontier.push_back((issuer, depth + 1));

            let chains = construct_chains(ctx, &task.cert, intermediates, &task.roots).await;
            if !chains.is_empty() {
                return Some(chains);
            }
        }
    }
    None
}

/// AIA bodies come as either DER or PEM; try both.
fn parse_cert_bytes(bytes: &[u8]) -> Result<Arc<Cert>, String> {
    match Cert::from_der(bytes.to_vec()) {
        Ok(cert) => Ok(cert),
        Err(der_err) => match Cert::from_pem(bytes) {
            Ok(cert) => Ok(cert),
            Err(pem_err) => Err(format!("not DER ({der_err}) nor PEM ({pem_err})")),
        },
    }
}

/// Keeps at most one error per failure kind, first occurrence wins.
fn dedup_errors(errors: Vec<FixError>) -> Vec<FixError> {
    let mut seen = HashSet::new();
    errors.into_iter().filter(|e| seen.insert(e.kind)).collect()
}

/// Drops every chain that strictly extends another chain in the set: when
/// both `[L, I]` and `[L, I, R]` verified, the shorter one is the useful
/// submission. Sorting shortest-first (bag hash as tie break, for
/// determinism) means each survivor only needs checking against shorter
/// survivors, and makes the operation idempotent.
fn remove_super_chains(mut chains: Vec<CertChain>) -> Vec<CertChain> {
    chains.sort_by(|a, b| {
        a.len()
            .cmp(&b.len())
            .then_with(|| hash_bag(a).cmp(&hash_bag(b)))
    });
    let mut kept: Vec<CertChain> = Vec::new();
    'next: for chain in chains {
        for shorter in &kept {
            if is_prefix(shorter, &chain) {
                continue 'next;
            }
        }
        kept.push(chain);
    }
    kept
}

fn is_prefix(prefix: &[Arc<Cert>], chain: &[Arc<Cert>]) -> bool {
    prefix.len() <= chain.len() && prefix.iter().zip(chain).all(|(a, b)| a.raw() == b.raw())
}
