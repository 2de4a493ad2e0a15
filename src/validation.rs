//! Validation fast path for the OCSP style responder.
//!
//! A lookup is one issuer resolution plus one keyed read. It never fetches,
//! never schedules and never scans.

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::model::{IssuerHashes, SerialNumber};
use crate::revocation::{RevocationStore, StoreResult};

#[derive(Debug, Clone)]
pub struct Validator<S: RevocationStore> {
    store: S,
}

impl<S: RevocationStore> Validator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Revocation date of `serial`, or `None` when it is not known revoked.
    ///
    /// Unknown issuers, including hashes of the wrong length, also yield
    /// `None`; deciding whether that is a trust failure is up to the caller.
    pub async fn validate(
        &self,
        serial: &SerialNumber,
        issuer_name_hash: &[u8],
        issuer_key_hash: &[u8],
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let Some(hashes) = IssuerHashes::from_slices(issuer_name_hash, issuer_key_hash) else {
            trace!("Issuer hashes are not SHA-1 sized");
            return Ok(None);
        };
        let Some(issuer) = self.store.resolve_issuer(&hashes).await? else {
            trace!(%hashes, "Unknown issuer");
            return Ok(None);
        };
        self.store.is_revoked(&issuer, serial).await
    }
}
