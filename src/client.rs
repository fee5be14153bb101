//! Contracts for the remote Certificate Transparency log. The HTTP client
//! implementing these traits lives outside this crate; everything here is the
//! wire shape (RFC 6962 JSON bodies) plus the error classification the
//! pipelines rely on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Base64 <-> raw bytes for the RFC 6962 JSON fields.
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("log returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ClientError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ClientError::Status { status: 429, .. })
    }
}

/// Signed tree head as returned by `get-sth`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedTreeHead {
    pub tree_size: u64,
    pub timestamp: u64,
    #[serde(with = "b64")]
    pub sha256_root_hash: Vec<u8>,
    #[serde(with = "b64")]
    pub tree_head_signature: Vec<u8>,
}

/// One entry from `get-entries`: the serialized `MerkleTreeLeaf` plus the
/// chain or precert data the log stored alongside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafEntry {
    #[serde(with = "b64")]
    pub leaf_input: Vec<u8>,
    #[serde(with = "b64")]
    pub extra_data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEntriesResponse {
    pub entries: Vec<LeafEntry>,
}

/// Body of an `add-chain` / `add-pre-chain` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddChainRequest {
    /// DER certificates, leaf first.
    pub chain: Vec<String>,
}

/// SCT returned by `add-chain`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedCertificateTimestamp {
    pub sct_version: u8,
    #[serde(with = "b64")]
    pub id: Vec<u8>,
    pub timestamp: u64,
    #[serde(with = "b64")]
    pub extensions: Vec<u8>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

/// Subset of the log read API used by the Fetcher.
#[async_trait]
pub trait LogClient: Send + Sync {
    /// Base URI of the log, for diagnostics only.
    fn base_uri(&self) -> &str;

    async fn get_sth(&self) -> Result<SignedTreeHead, ClientError>;

    /// Requests entries in the inclusive range `[start, end]`. The log may
    /// return fewer entries than requested.
    async fn get_raw_entries(&self, start: u64, end: u64)
        -> Result<GetEntriesResponse, ClientError>;
}

/// Subset of the log write API used by the Logger.
#[async_trait]
pub trait AddLogClient: Send + Sync {
    /// Submits a DER chain (leaf first) via `add-chain`.
    async fn add_chain(
        &self,
        chain: &[Vec<u8>],
    ) -> Result<SignedCertificateTimestamp, ClientError>;

    /// Fetches the roots the log accepts, as DER.
    async fn get_accepted_roots(&self) -> Result<Vec<Vec<u8>>, ClientError>;
}
