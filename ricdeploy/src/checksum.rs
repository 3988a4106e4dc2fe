//! Content digests for confirming that a copy matches its source.

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};

use crate::errors::DeployError;

/// Digest algorithm used for comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// SHA-256.
    #[default]
    Sha256,
    /// MD5, matching `md5sum` output.
    Md5,
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Md5 => write!(f, "md5"),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "md5" => Ok(Self::Md5),
            other => Err(DeployError::config(format!("unknown digest algorithm '{other}'"))),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Md5(Md5),
}

impl Hasher {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            DigestAlgorithm::Md5 => Self::Md5(Md5::new()),
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(bytes),
            Self::Md5(h) => h.update(bytes),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Md5(h) => hex::encode(h.finalize()),
        }
    }
}

/// The two digests of one comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumPair {
    /// Digest of the source content.
    pub source_digest: String,
    /// Digest of the destination content.
    pub dest_digest: String,
}

impl ChecksumPair {
    /// Returns true if both digests are equal.
    #[must_use]
    pub fn matches(&self) -> bool {
        self.source_digest == self.dest_digest
    }
}

/// Result of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumOutcome {
    /// Digests are equal.
    Match(ChecksumPair),
    /// Digests differ.
    Mismatch(ChecksumPair),
}

impl ChecksumOutcome {
    fn from_pair(pair: ChecksumPair) -> Self {
        if pair.matches() {
            Self::Match(pair)
        } else {
            Self::Mismatch(pair)
        }
    }

    /// Returns true on [`ChecksumOutcome::Match`].
    #[must_use]
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match(_))
    }

    /// Returns the compared digests.
    #[must_use]
    pub fn pair(&self) -> &ChecksumPair {
        match self {
            Self::Match(pair) | Self::Mismatch(pair) => pair,
        }
    }

    /// Converts a mismatch into [`DeployError::ChecksumMismatch`] for `subject`.
    pub fn into_result(self, subject: impl Into<String>) -> Result<ChecksumPair, DeployError> {
        match self {
            Self::Match(pair) => Ok(pair),
            Self::Mismatch(pair) => Err(DeployError::checksum_mismatch(
                subject,
                pair.source_digest,
                pair.dest_digest,
            )),
        }
    }
}

/// Compares byte blobs, files and streams by digest.
///
/// Unreadable inputs are digested as empty content; callers that need the
/// source to exist must check that themselves. A mismatch is never retried
/// here.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChecksumVerifier {
    algorithm: DigestAlgorithm,
}

impl ChecksumVerifier {
    /// Creates a verifier using `algorithm`.
    #[must_use]
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        Self { algorithm }
    }

    /// Returns the configured algorithm.
    #[must_use]
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Hex digest of `bytes`.
    #[must_use]
    pub fn digest(&self, bytes: &[u8]) -> String {
        let mut hasher = Hasher::new(self.algorithm);
        hasher.update(bytes);
        hasher.finalize_hex()
    }

    /// Hex digest of everything `reader` yields.
    pub async fn digest_reader<R>(&self, mut reader: R) -> std::io::Result<String>
    where
        R: AsyncRead + Unpin,
    {
        let mut hasher = Hasher::new(self.algorithm);
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize_hex())
    }

    /// Compares two in-memory blobs.
    #[must_use]
    pub fn verify(&self, source: &[u8], dest: &[u8]) -> ChecksumOutcome {
        let pair = ChecksumPair {
            source_digest: self.digest(source),
            dest_digest: self.digest(dest),
        };
        self.report(&pair);
        ChecksumOutcome::from_pair(pair)
    }

    /// Compares two files on disk.
    pub async fn verify_files(&self, source: &Path, dest: &Path) -> ChecksumOutcome {
        let pair = ChecksumPair {
            source_digest: self.digest_file(source).await,
            dest_digest: self.digest_file(dest).await,
        };
        self.report(&pair);
        ChecksumOutcome::from_pair(pair)
    }

    /// Compares two streams.
    pub async fn verify_readers<S, D>(&self, source: S, dest: D) -> ChecksumOutcome
    where
        S: AsyncRead + Unpin,
        D: AsyncRead + Unpin,
    {
        let source_digest = match self.digest_reader(source).await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "Source stream unreadable, digesting as empty");
                self.digest(&[])
            }
        };
        let dest_digest = match self.digest_reader(dest).await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "Destination stream unreadable, digesting as empty");
                self.digest(&[])
            }
        };
        let pair = ChecksumPair {
            source_digest,
            dest_digest,
        };
        self.report(&pair);
        ChecksumOutcome::from_pair(pair)
    }

    async fn digest_file(&self, path: &Path) -> String {
        match tokio::fs::File::open(path).await {
            Ok(file) => match self.digest_reader(file).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "File unreadable, digesting as empty");
                    self.digest(&[])
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "File unreadable, digesting as empty");
                self.digest(&[])
            }
        }
    }

    fn report(&self, pair: &ChecksumPair) {
        info!(
            algorithm = %self.algorithm,
            source = %pair.source_digest,
            dest = %pair.dest_digest,
            matched = pair.matches(),
            "Checksum comparison"
        );
    }
}
