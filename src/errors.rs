use std::fmt;
use std::sync::Arc;

use crate::cert::{Cert, CertChain};

/// The closed set of failure kinds surfaced by the fixing and logging
/// pipelines. Consumers filter the error channel by this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixErrorKind {
    /// Sentinel for "no failure".
    None,
    /// DER/PEM bytes did not parse as a certificate.
    ParseFailure,
    /// Retrieving an intermediate returned HTTP status >= 400.
    CannotFetchUrl,
    /// Malformed or non-web AIA URL.
    BadUrl,
    /// Transport-level failure retrieving an intermediate.
    FailedHttpRequest,
    /// The remote log rejected add-chain.
    LogPostFailed,
    /// Path construction did not reach a trusted root with the material at hand.
    VerifyFailed,
    /// AIA expansion was exhausted and still no path was found.
    FixFailed,
}

impl FixErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixErrorKind::None => "None",
            FixErrorKind::ParseFailure => "ParseFailure",
            FixErrorKind::CannotFetchUrl => "CannotFetchUrl",
            FixErrorKind::BadUrl => "BadUrl",
            FixErrorKind::FailedHttpRequest => "FailedHttpRequest",
            FixErrorKind::LogPostFailed => "LogPostFailed",
            FixErrorKind::VerifyFailed => "VerifyFailed",
            FixErrorKind::FixFailed => "FixFailed",
        }
    }
}

impl fmt::Display for FixErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failure event from the pipelines, carrying whatever context the stage
/// had: the leaf being fixed, the chain involved, the offending URL, and the
/// bytes that would not parse.
#[derive(Debug, Clone)]
pub struct FixError {
    pub kind: FixErrorKind,
    pub cert: Option<Arc<Cert>>,
    pub chain: CertChain,
    pub url: Option<String>,
    pub bad: Option<Vec<u8>>,
    pub reason: String,
}

impl FixError {
    pub fn new(kind: FixErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            cert: None,
            chain: Vec::new(),
            url: None,
            bad: None,
            reason: reason.into(),
        }
    }

    pub fn with_cert(mut self, cert: Arc<Cert>) -> Self {
        self.cert = Some(cert);
        self
    }

    pub fn with_chain(mut self, chain: CertChain) -> Self {
        self.chain = chain;
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_bad(mut self, bad: Vec<u8>) -> Self {
        self.bad = Some(bad);
        self
    }
}

// Display spells out the kind, cause, and whatever context is attached; the
// surrounding error sink stores these as flat strings.
impl fmt::Display for FixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)?;
        if let Some(cert) = &self.cert {
            write!(f, " (leaf: {})", cert.subject())?;
        }
        if let Some(url) = &self.url {
            write!(f, " (url: {url})")?;
        }
        if !self.chain.is_empty() {
            let subjects: Vec<&str> = self.chain.iter().map(|c| c.subject()).collect();
            write!(f, " (chain: {})", subjects.join(" -> "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::utils::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(FixErrorKind::VerifyFailed.as_str(), "VerifyFailed");
        assert_eq!(FixErrorKind::LogPostFailed.to_string(), "LogPostFailed");
    }

    #[test]
    fn display_includes_context() {
        let (root_key, root) = self_signed_root("CN=Err Root");
        let leaf = leaf_cert("CN=err.example.com", "CN=Err Root", &root_key);
        let err = FixError::new(FixErrorKind::CannotFetchUrl, "404 Not Found")
            .with_cert(leaf.clone())
            .with_chain(vec![leaf, root])
            .with_url("http://ca.example.com/x.der");
        let s = err.to_string();
        assert!(s.contains("CannotFetchUrl"));
        assert!(s.contains("404 Not Found"));
        assert!(s.contains("CN=err.example.com"));
        assert!(s.contains("http://ca.example.com/x.der"));
        assert!(s.contains("->"));
    }
}
