use std::fmt;
use std::sync::OnceLock;

use ring::digest::{self, Algorithm};
use thiserror::Error;

static INIT: OnceLock<Result<(), CryptoError>> = OnceLock::new();

const SHA1_EMPTY: &str = "da39a3ee5e6b4b0d3255bfef95601890afd80709";
const SHA256_EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    #[error("{0} self-test failed")]
    SelfTest(HashAlg),
}

/// Hash algorithms used for issuer lookups and authority fingerprints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    /// SHA-1, only used for the OCSP issuer name and key hashes
    Sha1,
    /// SHA-256
    Sha256,
}

impl HashAlg {
    /// Hash the given data with this hash algorithm
    pub fn hash(&self, data: impl AsRef<[u8]>) -> Vec<u8> {
        digest::digest(self.algorithm(), data.as_ref())
            .as_ref()
            .to_vec()
    }

    /// Hash the concatenation of all parts
    pub fn hash_parts<'a>(&self, parts: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
        let mut ctx = digest::Context::new(self.algorithm());
        for part in parts {
            ctx.update(part);
        }
        ctx.finish().as_ref().to_vec()
    }

    /// Get the output size in bytes
    pub fn output_size(self) -> usize {
        self.algorithm().output_len()
    }

    fn algorithm(&self) -> &'static Algorithm {
        match self {
            HashAlg::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            HashAlg::Sha256 => &digest::SHA256,
        }
    }
}

impl fmt::Display for HashAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlg::Sha1 => "SHA-1",
            HashAlg::Sha256 => "SHA-256",
        };
        write!(f, "{name}")
    }
}

/// One-time crypto start-up check, run by the binary before anything else.
///
/// `ring` carries no global provider state; this only runs the digest
/// self-test once so a broken build fails at start-up instead of on the
/// first lookup.
pub fn init() -> Result<(), CryptoError> {
    INIT.get_or_init(|| {
        for (alg, expected) in [(HashAlg::Sha1, SHA1_EMPTY), (HashAlg::Sha256, SHA256_EMPTY)] {
            if hex::encode(alg.hash(b"")) != expected {
                return Err(CryptoError::SelfTest(alg));
            }
        }
        tracing::debug!("crypto self-test passed");
        Ok(())
    })
    .clone()
}
