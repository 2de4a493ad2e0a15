use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use super::{CrlDelta, MergeOutcome, RevocationStore, StoreError, StoreResult};
use crate::model::{
    AuthorityStatus, CertificateAuthority, CrlNumber, IssuerHashes, RevokedCertificate,
    SerialNumber,
};

#[derive(Debug, Clone)]
struct Row {
    revocation_date: DateTime<Utc>,
    crl_number: CrlNumber,
}

/// Everything cached for one issuer, guarded by a single lock.
#[derive(Debug, Default)]
struct Partition {
    authority: Option<CertificateAuthority>,
    /// Highest CRL number stored for the issuer, by a merge or a manual insert.
    current: Option<CrlNumber>,
    rows: HashMap<SerialNumber, Row>,
    /// Set once the authority is purged; late writers must not revive it.
    removed: bool,
}

impl Partition {
    fn to_revoked(&self, issuer: &str, serial: &SerialNumber) -> Option<RevokedCertificate> {
        self.rows.get(serial).map(|row| RevokedCertificate {
            issuer: issuer.to_string(),
            serial_number: serial.clone(),
            revocation_date: row.revocation_date,
            crl_number: row.crl_number.clone(),
        })
    }

    fn prune_older_than(&mut self, crl_number: &CrlNumber) -> usize {
        let before = self.rows.len();
        self.rows.retain(|_, row| row.crl_number >= *crl_number);
        before - self.rows.len()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Corrupted("issuer partition lock poisoned".to_string())
}

/// An in-memory revocation store.
///
/// Issuers live in independent partitions so merges for different issuers
/// never contend, while merges for the same issuer serialize on the
/// partition's write lock. Lookups only take the read lock.
#[derive(Debug, Default, Clone)]
pub struct MemoryRevocationStore {
    partitions: Arc<DashMap<String, Arc<RwLock<Partition>>>>,
    issuer_index: Arc<DashMap<IssuerHashes, String>>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, issuer: &str) -> Option<Arc<RwLock<Partition>>> {
        self.partitions.get(issuer).map(|entry| Arc::clone(entry.value()))
    }

    fn partition_or_default(&self, issuer: &str) -> Arc<RwLock<Partition>> {
        Arc::clone(
            self.partitions
                .entry(issuer.to_string())
                .or_default()
                .value(),
        )
    }

    /// Total number of cached rows, across all issuers.
    pub fn len(&self) -> usize {
        self.partitions
            .iter()
            .filter_map(|entry| entry.value().read().ok().map(|p| p.rows.len()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RevocationStore for MemoryRevocationStore {
    async fn register_authority(&self, authority: CertificateAuthority) -> StoreResult<()> {
        let handle = loop {
            let handle = self.partition_or_default(&authority.name);
            if !handle.read().map_err(poisoned)?.removed {
                break handle;
            }
            // A concurrent removal has not yet dropped the purged partition.
            self.partitions
                .remove_if(&authority.name, |_, current| Arc::ptr_eq(current, &handle));
        };
        let mut partition = handle.write().map_err(poisoned)?;

        let merged = match partition.authority.take() {
            Some(existing) => {
                if existing.hashes != authority.hashes {
                    self.issuer_index
                        .remove_if(&existing.hashes, |_, name| *name == authority.name);
                }
                CertificateAuthority {
                    status: existing.status,
                    last_crl_number: existing.last_crl_number,
                    this_update: existing.this_update,
                    next_update: existing.next_update,
                    ..authority
                }
            }
            None => authority,
        };

        self.issuer_index.insert(merged.hashes, merged.name.clone());
        debug!(issuer = %merged.name, hashes = %merged.hashes, "registered authority");
        partition.authority = Some(merged);
        Ok(())
    }

    async fn authority(&self, issuer: &str) -> StoreResult<Option<CertificateAuthority>> {
        let Some(partition) = self.partition(issuer) else {
            return Ok(None);
        };
        let partition = partition.read().map_err(poisoned)?;
        Ok(partition.authority.clone())
    }

    async fn authorities(&self) -> StoreResult<Vec<CertificateAuthority>> {
        let partitions: Vec<_> = self
            .partitions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut authorities = Vec::new();
        for partition in partitions {
            if let Some(authority) = &partition.read().map_err(poisoned)?.authority {
                authorities.push(authority.clone());
            }
        }
        authorities.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(authorities)
    }

    async fn set_status(&self, issuer: &str, status: AuthorityStatus) -> StoreResult<()> {
        let partition = self
            .partition(issuer)
            .ok_or_else(|| StoreError::UnknownIssuer(issuer.to_string()))?;
        let mut partition = partition.write().map_err(poisoned)?;
        match partition.authority.as_mut() {
            Some(authority) => {
                authority.status = status;
                Ok(())
            }
            None => Err(StoreError::UnknownIssuer(issuer.to_string())),
        }
    }

    async fn resolve_issuer(&self, hashes: &IssuerHashes) -> StoreResult<Option<String>> {
        Ok(self.issuer_index.get(hashes).map(|name| name.value().clone()))
    }

    async fn remove_authority(&self, issuer: &str) -> StoreResult<usize> {
        let Some(partition) = self.partition(issuer) else {
            return Ok(0);
        };

        let purged = {
            let mut partition = partition.write().map_err(poisoned)?;
            if let Some(authority) = partition.authority.take() {
                self.issuer_index
                    .remove_if(&authority.hashes, |_, name| name == issuer);
            }
            partition.removed = true;
            partition.current = None;
            let purged = partition.rows.len();
            partition.rows.clear();
            purged
        };

        self.partitions
            .remove_if(issuer, |_, current| Arc::ptr_eq(current, &partition));
        debug!(issuer, purged, "removed authority");
        Ok(purged)
    }

    async fn add_revoked(&self, revoked: RevokedCertificate) -> StoreResult<()> {
        let partition = self.partition_or_default(&revoked.issuer);
        let mut partition = partition.write().map_err(poisoned)?;

        if let Some(current) = &partition.current
            && revoked.crl_number < *current
        {
            return Err(StoreError::StaleEntry {
                issuer: revoked.issuer,
                serial: revoked.serial_number,
                current: current.clone(),
            });
        }
        if let Some(existing) = partition.rows.get(&revoked.serial_number)
            && existing.crl_number >= revoked.crl_number
        {
            return Err(StoreError::DuplicateEntry {
                issuer: revoked.issuer,
                serial: revoked.serial_number,
                crl_number: existing.crl_number.clone(),
            });
        }

        if partition
            .current
            .as_ref()
            .is_none_or(|current| *current < revoked.crl_number)
        {
            partition.current = Some(revoked.crl_number.clone());
        }
        partition.rows.insert(
            revoked.serial_number,
            Row {
                revocation_date: revoked.revocation_date,
                crl_number: revoked.crl_number,
            },
        );
        Ok(())
    }

    async fn merge_delta(&self, delta: CrlDelta) -> StoreResult<MergeOutcome> {
        let partition = self
            .partition(&delta.issuer)
            .ok_or_else(|| StoreError::UnknownIssuer(delta.issuer.clone()))?;
        let mut partition = partition.write().map_err(poisoned)?;

        if partition.removed || partition.authority.is_none() {
            return Err(StoreError::UnknownIssuer(delta.issuer));
        }
        if let Some(current) = &partition.current
            && *current >= delta.crl_number
        {
            return Ok(MergeOutcome::Stale {
                current: current.clone(),
            });
        }

        // Insert first, prune second.
        let mut inserted = 0;
        for entry in delta.entries {
            let row = Row {
                revocation_date: entry.revocation_date,
                crl_number: delta.crl_number.clone(),
            };
            if partition.rows.insert(entry.serial_number, row).is_none() {
                inserted += 1;
            }
        }
        let pruned = partition.prune_older_than(&delta.crl_number);

        partition.current = Some(delta.crl_number.clone());
        if let Some(authority) = partition.authority.as_mut() {
            authority.status = AuthorityStatus::Active;
            authority.last_crl_number = Some(delta.crl_number);
            authority.this_update = delta.this_update;
            authority.next_update = delta.next_update;
        }

        Ok(MergeOutcome::Applied { inserted, pruned })
    }

    async fn count_revoked(&self, issuer: &str, crl_number: &CrlNumber) -> StoreResult<usize> {
        let Some(partition) = self.partition(issuer) else {
            return Ok(0);
        };
        let partition = partition.read().map_err(poisoned)?;
        Ok(partition
            .rows
            .values()
            .filter(|row| row.crl_number == *crl_number)
            .count())
    }

    async fn find_revoked(
        &self,
        issuer: &str,
        serial: &SerialNumber,
    ) -> StoreResult<Option<RevokedCertificate>> {
        let Some(partition) = self.partition(issuer) else {
            return Ok(None);
        };
        let partition = partition.read().map_err(poisoned)?;
        Ok(partition.to_revoked(issuer, serial))
    }

    async fn prune_older_than(&self, issuer: &str, crl_number: &CrlNumber) -> StoreResult<usize> {
        let Some(partition) = self.partition(issuer) else {
            return Ok(0);
        };
        let mut partition = partition.write().map_err(poisoned)?;
        Ok(partition.prune_older_than(crl_number))
    }

    async fn is_revoked(
        &self,
        issuer: &str,
        serial: &SerialNumber,
    ) -> StoreResult<Option<DateTime<Utc>>> {
        let Some(partition) = self.partition(issuer) else {
            return Ok(None);
        };
        let partition = partition.read().map_err(poisoned)?;
        Ok(partition.rows.get(serial).map(|row| row.revocation_date))
    }
}
