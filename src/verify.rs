use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use openssl::x509::X509;

use crate::cert::{Cert, CertChain, CertPool};
use crate::hash::{hash_cert, HASH_SIZE};

/// Longest path, in certificates, followed from a leaf towards the roots.
pub const MAX_CHAIN_LENGTH: usize = 20;

/// Enumerates verified issuance paths. Signature checks go through openssl;
/// DER -> `X509` conversions are cached because the same issuers are checked
/// over and over while fixing a stream of related chains.
pub struct ChainVerifier {
    x509_cache: Cache<[u8; HASH_SIZE], Arc<X509>>,
}

impl ChainVerifier {
    pub fn new() -> Self {
        let x509_cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(3600))
            .build();
        Self { x509_cache }
    }

    async fn to_x509(&self, cert: &Cert) -> Option<Arc<X509>> {
        let key = hash_cert(cert);
        if let Some(cached) = self.x509_cache.get(&key).await {
            return Some(cached);
        }
        match X509::from_der(cert.raw()) {
            Ok(x509) => {
                let x509 = Arc::new(x509);
                self.x509_cache.insert(key, x509.clone()).await;
                Some(x509)
            }
            Err(e) => {
                tracing::debug!(subject = cert.subject(), error = %e, "openssl rejected certificate");
                None
            }
        }
    }

    /// Whether `issuer` actually signed `child`. Name agreement is assumed to
    /// have been checked by the caller (the pools index by subject).
    pub async fn signature_valid(&self, child: &Cert, issuer: &Cert) -> bool {
        let (Some(child), Some(issuer)) = (self.to_x509(child).await, self.to_x509(issuer).await)
        else {
            return false;
        };
        let Ok(public_key) = issuer.public_key() else {
            return false;
        };
        child.verify(&public_key).unwrap_or(false)
    }

    /// Every distinct verified path from `leaf` to a certificate in `roots`,
    /// using `intermediates` as link material. Returned chains include the
    /// root; multiple roots or cross-signed intermediates yield multiple
    /// chains. Expiry is deliberately not checked: chains being fixed often
    /// pass through retired intermediates.
    pub async fn build_paths(
        &self,
        leaf: &Arc<Cert>,
        intermediates: &CertPool,
        roots: &CertPool,
    ) -> Vec<CertChain> {
        let mut found = Vec::new();
        let mut pending: Vec<CertChain> = vec![vec![leaf.clone()]];

        while let Some(path) = pending.pop() {
            let tip = path.last().expect("paths are never empty").clone();

            if roots.includes(&tip) {
                found.push(path);
                continue;
            }
            if path.len() >= MAX_CHAIN_LENGTH {
                continue;
            }

            for root in roots.potential_issuers(&tip) {
                if self.signature_valid(&tip, root).await {
                    let mut complete = path.clone();
                    complete.push(root.clone());
                    found.push(complete);
                }
            }

            for issuer in intermediates.potential_issuers(&tip) {
                // Roots were handled above; skipping them here keeps paths
                // from being found twice when the hint includes the root.
                if roots.includes(issuer) {
                    continue;
                }
                if path.iter().any(|c| c.raw() == issuer.raw()) {
                    continue;
                }
                if self.signature_valid(&tip, issuer).await {
                    let mut extended = path.clone();
                    extended.push(issuer.clone());
                    pending.push(extended);
                }
            }
        }

        found
    }
}

impl Default for ChainVerifier {
    fn default() -> Self {
        Self::new()
    }
}
