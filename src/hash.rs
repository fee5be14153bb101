use std::cmp::Ordering;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::cert::Cert;

pub const HASH_SIZE: usize = 32;

/// SHA-256 over the certificate's DER bytes.
pub fn hash_cert(cert: &Cert) -> [u8; HASH_SIZE] {
    Sha256::digest(cert.raw()).into()
}

/// Running SHA-256 of the per-certificate hashes, in chain order. Two chains
/// collide only if they contain the same certificates in the same order with
/// the same duplicates; this is the identity of a submission attempt.
pub fn hash_chain(chain: &[Arc<Cert>]) -> [u8; HASH_SIZE] {
    let mut hasher = Sha256::new();
    for cert in chain {
        hasher.update(hash_cert(cert));
    }
    hasher.finalize().into()
}

/// Order-insensitive, duplicate-sensitive hash of a chain: the chain hash of
/// the certificates sorted by raw DER (shorter first, then lexicographic).
/// Permutations of the same multiset of certificates hash identically.
pub fn hash_bag(chain: &[Arc<Cert>]) -> [u8; HASH_SIZE] {
    let mut bag: Vec<Arc<Cert>> = chain.to_vec();
    bag.sort_by(|a, b| compare_raw(a.raw(), b.raw()));
    hash_chain(&bag)
}

fn compare_raw(a: &[u8], b: &[u8]) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}
