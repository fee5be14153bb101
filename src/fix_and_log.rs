use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::LockedMap;
use crate::cert::{dedup_certs, Cert, CertPool};
use crate::client::AddLogClient;
use crate::errors::FixError;
use crate::fixer::Fixer;
use crate::hash::hash_cert;
use crate::limiter::Limiter;
use crate::logger::{Logger, LoggerError};

/// Everything a `FixAndLog` needs; all fields are required.
pub struct FixAndLogConfig {
    pub fixer_workers: usize,
    pub logger_workers: usize,
    /// Used for AIA fetches while fixing.
    pub http_client: reqwest::Client,
    /// Used for add-chain and get-roots.
    pub log_client: Arc<dyn AddLogClient>,
    pub limiter: Arc<dyn Limiter>,
    /// Emit once-per-second counter lines from both pools.
    pub log_stats: bool,
}

/// A Fixer and a Logger wired together: every chain the Fixer repairs is
/// queued for posting. Failures from both stages share one error channel.
pub struct FixAndLog {
    fixer: Fixer,
    logger: Arc<Logger>,
    forwarder: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Leaves already handled by `queue_all_certs_in_chain`.
    done: LockedMap,
    already_posted: AtomicU32,
}

impl FixAndLog {
    /// Bootstraps the Logger (fetching the log's roots) and starts both
    /// worker pools. Errors from either stage arrive on `errors`.
    pub async fn new(
        config: FixAndLogConfig,
        errors: mpsc::UnboundedSender<FixError>,
    ) -> Result<Self, LoggerError> {
        let logger = Arc::new(
            Logger::new(
                config.logger_workers,
                errors.clone(),
                config.log_client,
                config.limiter,
                config.log_stats,
            )
            .await?,
        );

        let (chains_tx, mut chains_rx) = mpsc::channel(1);
        let fixer = Fixer::new(
            config.fixer_workers,
            chains_tx,
            errors,
            config.http_client,
            config.log_stats,
        );

        let forwarder = {
            let logger = logger.clone();
            tokio::spawn(async move {
                while let Some(chain) = chains_rx.recv().await {
                    logger.queue_chain(chain).await;
                }
            })
        };

        Ok(Self {
            fixer,
            logger,
            forwarder: std::sync::Mutex::new(Some(forwarder)),
            done: LockedMap::new(),
            already_posted: AtomicU32::new(0),
        })
    }

    /// Queues a single leaf with its hinted chain for fixing against `roots`,
    /// posting whatever verifies. A leaf that already has an accepted chain
    /// is skipped outright.
    pub async fn queue_chain(&self, cert: Arc<Cert>, chain: &[Arc<Cert>], roots: Arc<CertPool>) {
        if self.logger.is_posted(&cert) {
            self.already_posted.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.fixer.queue_chain(cert, chain, roots).await;
    }

    /// Treats every certificate in the (deduplicated) chain as a potential
    /// leaf, hinted by the certificates after it: for each suffix of length
    /// at least two, `chain[i]` is queued with `chain[i+1..]` as its hint.
    /// This explores the "who issued whom" possibilities when the input
    /// order is not trustworthy.
    pub async fn queue_all_certs_in_chain(&self, chain: &[Arc<Cert>]) {
        if chain.is_empty() {
            return;
        }
        let deduped = dedup_certs(chain);
        let roots = self.logger.root_certs();
        for i in 0..deduped.len().saturating_sub(1) {
            let cert = &deduped[i];
            if self.logger.is_posted(cert) {
                self.already_posted.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let h = hash_cert(cert);
            if self.done.get(h) {
                continue;
            }
            self.done.set(h, true);
            self.fixer
                .queue_chain(cert.clone(), &deduped[i + 1..], roots.clone())
                .await;
        }
    }

    pub fn root_certs(&self) -> Arc<CertPool> {
        self.logger.root_certs()
    }

    pub fn fixer_stats(&self) -> crate::fixer::FixerStats {
        self.fixer.stats()
    }

    pub fn logger_stats(&self) -> crate::logger::LoggerStats {
        self.logger.stats()
    }

    /// Chains skipped because their leaf already had an accepted chain.
    pub fn already_posted(&self) -> u32 {
        self.already_posted.load(Ordering::Relaxed)
    }

    /// Drains the pipeline in dependency order: fix tasks first, then the
    /// chains channel (closed by shutting the fixer down), then queued posts.
    /// After this returns the caller may close the error channel.
    pub async fn wait(&self) {
        self.fixer.wait().await;
        self.fixer.close();
        let forwarder = self
            .forwarder
            .lock()
            .expect("forwarder handle poisoned")
            .take();
        if let Some(handle) = forwarder {
            if handle.await.is_err() {
                tracing::warn!("chain forwarder panicked");
            }
        }
        self.logger.wait().await;
    }
}
