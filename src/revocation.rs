//! Revocation store: durable, per-issuer revoked-certificate rows plus the
//! per-authority refresh metadata.
//!
//! The central operation is [`RevocationStore::merge_delta`], which applies a
//! freshly parsed CRL in one atomic step per issuer:
//!
//! 1. reject the merge when the issuer is unknown,
//! 2. ignore it when the CRL number is not newer than the highest one stored,
//! 3. insert (or re-stamp) every listed serial with the new CRL number,
//! 4. prune every row of that issuer still carrying an older CRL number.
//!
//! Re-delivering the same CRL is therefore a no-op, and an out-of-order older
//! CRL never overwrites a newer state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

mod memory;
mod redis;

pub use memory::MemoryRevocationStore;
pub use redis::RedisRevocationStore;

use crate::model::{
    AuthorityStatus, CertificateAuthority, CrlNumber, IssuerHashes, RevokedCertificate,
    RevokedEntry, SerialNumber,
};

/// Error type for revocation store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Revocation entry for {issuer} serial {serial} already present with CRL number {crl_number}")]
    DuplicateEntry {
        issuer: String,
        serial: SerialNumber,
        crl_number: CrlNumber,
    },

    #[error("Revocation entry for {issuer} serial {serial} is older than CRL number {current}")]
    StaleEntry {
        issuer: String,
        serial: SerialNumber,
        current: CrlNumber,
    },

    #[error("Unknown issuer: {0}")]
    UnknownIssuer(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupted store data: {0}")]
    Corrupted(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether the caller should retry the operation later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<::redis::RedisError> for StoreError {
    fn from(error: ::redis::RedisError) -> Self {
        StoreError::Unavailable(error.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A newly obtained CRL, reduced to what the cache keeps.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CrlDelta {
    pub issuer: String,
    pub crl_number: CrlNumber,
    #[serde(default)]
    pub this_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_update: Option<DateTime<Utc>>,
    pub entries: Vec<RevokedEntry>,
}

impl CrlDelta {
    pub fn new(
        issuer: impl Into<String>,
        crl_number: impl Into<CrlNumber>,
        entries: impl IntoIterator<Item = RevokedEntry>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            crl_number: crl_number.into(),
            this_update: None,
            next_update: None,
            entries: entries.into_iter().collect(),
        }
    }
}

/// Result of a merge that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The CRL was newer and is now the cached state.
    Applied { inserted: usize, pruned: usize },
    /// The CRL number was not newer than `current`; nothing changed.
    Stale { current: CrlNumber },
}

impl MergeOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, MergeOutcome::Applied { .. })
    }
}

/// Abstract interface for revocation storage backends.
///
/// Every mutation is atomic per issuer. Readers observe either the state
/// before or after a merge, never a partially pruned one.
#[async_trait]
pub trait RevocationStore: Send + Sync + Clone + 'static {
    /// Registers (or refreshes) an authority and its issuer hash index entry.
    ///
    /// Re-registering a known authority keeps its CRL state.
    async fn register_authority(&self, authority: CertificateAuthority) -> StoreResult<()>;

    async fn authority(&self, issuer: &str) -> StoreResult<Option<CertificateAuthority>>;

    async fn authorities(&self) -> StoreResult<Vec<CertificateAuthority>>;

    /// Updates the cache status of a registered authority.
    async fn set_status(&self, issuer: &str, status: AuthorityStatus) -> StoreResult<()>;

    /// Resolves OCSP issuer hashes to an authority name.
    async fn resolve_issuer(&self, hashes: &IssuerHashes) -> StoreResult<Option<String>>;

    /// Purges an authority together with all of its revoked rows.
    ///
    /// Returns the number of purged rows; unknown issuers purge nothing.
    async fn remove_authority(&self, issuer: &str) -> StoreResult<usize>;

    /// Inserts a single row, for manual revocation.
    ///
    /// Fails with [`StoreError::StaleEntry`] when the CRL number is below the
    /// highest one stored for the issuer, and with
    /// [`StoreError::DuplicateEntry`] when the serial is already present with
    /// an equal or newer CRL number. Accepted rows raise the issuer's CRL
    /// number, so a later merge of an older CRL is stale.
    async fn add_revoked(&self, revoked: RevokedCertificate) -> StoreResult<()>;

    /// Applies a CRL, see the module documentation.
    async fn merge_delta(&self, delta: CrlDelta) -> StoreResult<MergeOutcome>;

    /// Number of rows of `issuer` carrying exactly `crl_number`.
    async fn count_revoked(&self, issuer: &str, crl_number: &CrlNumber) -> StoreResult<usize>;

    async fn find_revoked(
        &self,
        issuer: &str,
        serial: &SerialNumber,
    ) -> StoreResult<Option<RevokedCertificate>>;

    /// Deletes the rows of `issuer` older than `crl_number`.
    async fn prune_older_than(&self, issuer: &str, crl_number: &CrlNumber) -> StoreResult<usize>;

    /// Point lookup backing the validation fast path.
    async fn is_revoked(
        &self,
        issuer: &str,
        serial: &SerialNumber,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        Ok(self
            .find_revoked(issuer, serial)
            .await?
            .map(|revoked| revoked.revocation_date))
    }
}
