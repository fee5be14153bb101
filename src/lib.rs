//! Certificate Transparency plumbing: a parallel, resumable log fetcher and
//! a chain-fixing / re-submission pipeline (`FixAndLog`).
//!
//! The [`Fetcher`] streams contiguous entry ranges out of a CT log through a
//! pool of workers, riding out rate limits, short responses, and (in
//! continuous mode) a tree that keeps growing. [`FixAndLog`] takes leaf
//! certificates with possibly broken issuance chains, rebuilds every valid
//! path to a set of trusted roots using AIA-resolved intermediates, and
//! asynchronously posts each accepted chain to a log, deduplicating work
//! through content-addressed caches.
//!
//! The CT wire client itself is not implemented here; both pipelines talk to
//! the log through the traits in [`client`].

pub mod backoff;
pub mod cache;
pub mod cert;
pub mod client;
pub mod errors;
pub mod fetcher;
pub mod fix_and_log;
pub mod fixer;
pub mod hash;
pub mod limiter;
pub mod logger;
pub mod sync;
pub mod url_cache;
pub mod verify;

#[cfg(test)]
mod test_utils;

pub use cert::{Cert, CertChain, CertError, CertPool};
pub use client::{AddLogClient, ClientError, LogClient};
pub use errors::{FixError, FixErrorKind};
pub use fetcher::{EntryBatch, Fetcher, FetcherOptions};
pub use fix_and_log::{FixAndLog, FixAndLogConfig};
pub use fixer::{Fixer, FixerStats};
pub use limiter::{Limiter, NoOpLimiter, TokenBucket};
pub use logger::{Logger, LoggerError, LoggerStats};
pub use url_cache::{UrlCache, UrlError};
