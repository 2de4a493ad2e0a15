use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ServiceError, ServiceResult, TrustService};
use crate::audit::AuditCategory;
use crate::dispatch::{ColdStartReport, HarvestReport, ReportListener, WorkerReport};
use crate::model::CertificateAuthority;
use crate::revocation::{CrlDelta, MergeOutcome, RevocationStore, StoreError};

const REPORT_POLL: Duration = Duration::from_secs(5);
const LISTENER_BACKOFF: Duration = Duration::from_secs(1);

impl<S: RevocationStore> TrustService<S> {
    /// Merges a harvested CRL into the revocation store.
    pub async fn complete_harvest(&self, report: HarvestReport) -> ServiceResult<MergeOutcome> {
        let issuer = report.issuer.clone();
        let delta = CrlDelta {
            issuer: report.issuer,
            crl_number: report.crl_number,
            this_update: report.this_update,
            next_update: report.next_update,
            entries: report.entries,
        };
        let crl_number = delta.crl_number.clone();

        match self.store.merge_delta(delta).await {
            Ok(outcome) => {
                match &outcome {
                    MergeOutcome::Applied { inserted, pruned } => {
                        self.counters.merge_applied();
                        info!(%issuer, %crl_number, inserted, pruned, "CRL merged");
                    }
                    MergeOutcome::Stale { current } => {
                        self.counters.merge_stale();
                        debug!(%issuer, %crl_number, %current, "Stale CRL ignored");
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                if matches!(e, StoreError::UnknownIssuer(_)) {
                    self.counters.merge_rejected();
                }
                self.audit.failure(
                    AuditCategory::Harvest,
                    format!("CRL {crl_number} of {issuer} not merged: {e}"),
                );
                Err(e.into())
            }
        }
    }

    /// Registers a CA fetched by the downloader under the trust point of its
    /// issuer.
    ///
    /// Returns `None` when the CA is already known or has expired.
    pub async fn complete_cold_start(
        &self,
        report: ColdStartReport,
    ) -> ServiceResult<Option<CertificateAuthority>> {
        let parent = self
            .store
            .authority(&report.parent_issuer)
            .await?
            .ok_or_else(|| ServiceError::AuthorityNotFound(report.parent_issuer.clone()))?;
        let der = hex::decode(report.certificate_der.trim())
            .map_err(|e| ServiceError::InvalidReport(format!("certificate is not hex: {e}")))?;

        let authority =
            CertificateAuthority::from_der(&der, parent.trust_point.clone(), report.crl_url)?;
        if self.store.authority(&authority.name).await?.is_some() {
            debug!(issuer = %authority.name, "Cold started CA already registered");
            return Ok(None);
        }
        if authority.is_expired_at(self.scheduler.now()) {
            self.audit.record(
                AuditCategory::Harvest,
                format!("Skipped expired CA {} from cold start", authority.name),
            );
            return Ok(None);
        }

        let owner = self
            .registry
            .trust_point(&parent.trust_point)
            .ok_or_else(|| ServiceError::TrustPointNotFound(parent.trust_point.clone()))?;
        self.register_in_chain(&owner, authority).await.map(Some)
    }

    /// Purges a CA and its revoked rows, returning the number of rows.
    pub async fn complete_removal(&self, issuer: &str) -> ServiceResult<usize> {
        let purged = self.store.remove_authority(issuer).await?;

        let mut changed = false;
        for trust_point in self.registry.trust_points() {
            if trust_point.authorities.iter().any(|name| name == issuer) {
                self.registry.update_trust_point(&trust_point.name, |tp| {
                    tp.authorities.retain(|name| name != issuer);
                });
                changed = true;
            }
        }
        if changed {
            self.registry.save().await?;
        }

        self.audit.record(
            AuditCategory::Harvest,
            format!("Removed CA {issuer} with {purged} revoked entries"),
        );
        Ok(purged)
    }

    pub async fn handle_report(&self, report: WorkerReport) -> ServiceResult<()> {
        match report {
            WorkerReport::Harvested(report) => self.complete_harvest(report).await.map(|_| ()),
            WorkerReport::Downloaded(report) => self.complete_cold_start(report).await.map(|_| ()),
            WorkerReport::Removed { issuer } => self.complete_removal(&issuer).await.map(|_| ()),
        }
    }

    /// Feeds reports from the Redis report queue into the intake until the
    /// task is aborted.
    pub fn spawn_report_listener(self: Arc<Self>, mut listener: ReportListener) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Report listener started");
            loop {
                match listener.next(REPORT_POLL).await {
                    Ok(Some(report)) => {
                        let Err(e) = self.handle_report(report.clone()).await else {
                            continue;
                        };
                        if !e.is_transient() {
                            warn!("Worker report rejected: {e}");
                            continue;
                        }
                        warn!("Worker report deferred: {e}");
                        if let Err(e) = listener.requeue(&report).await {
                            warn!("Worker report lost, requeue failed: {e}");
                        }
                        tokio::time::sleep(LISTENER_BACKOFF).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("Report queue unavailable: {e}");
                        tokio::time::sleep(LISTENER_BACKOFF).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{ca_der, service};
    use super::*;
    use crate::dispatch::{DispatchMessage, FetchMode};
    use crate::model::{AuthorityStatus, CrlNumber, RevokedEntry, SerialNumber};
    use chrono::Utc;

    fn harvest(issuer: &str, crl_number: u64, serials: &[u64]) -> HarvestReport {
        let now = Utc::now();
        HarvestReport {
            issuer: issuer.to_string(),
            crl_number: CrlNumber::from(crl_number),
            this_update: Some(now),
            next_update: None,
            entries: serials
                .iter()
                .map(|serial| RevokedEntry::new(*serial, now))
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_harvest_applies_then_ignores_stale() {
        let (service, _queues) = service().await;
        let tp = service
            .add_trust_point(None, &ca_der("Root CA", Some("http://crl.example.com/r.crl")))
            .await
            .unwrap();

        let outcome = service
            .complete_harvest(harvest(&tp.name, 10, &[1, 2]))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Applied {
                inserted: 2,
                pruned: 0
            }
        );
        let authority = service.store().authority(&tp.name).await.unwrap().unwrap();
        assert_eq!(authority.status, AuthorityStatus::Active);

        let outcome = service
            .complete_harvest(harvest(&tp.name, 9, &[3]))
            .await
            .unwrap();
        assert!(matches!(outcome, MergeOutcome::Stale { .. }));
        assert!(
            service
                .store()
                .find_revoked(&tp.name, &SerialNumber::from(3u64))
                .await
                .unwrap()
                .is_none()
        );

        let counters = service.counters().snapshot();
        assert_eq!(counters.merges_applied, 1);
        assert_eq!(counters.merges_stale, 1);
    }

    #[tokio::test]
    async fn test_harvest_for_unknown_issuer_is_rejected() {
        let (service, _queues) = service().await;
        let err = service
            .complete_harvest(harvest("CN=Nobody", 1, &[1]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Store(StoreError::UnknownIssuer(_))
        ));
        assert_eq!(service.counters().snapshot().merges_rejected, 1);
    }

    #[tokio::test]
    async fn test_cold_start_registers_under_parent_trust_point() {
        let (service, mut queues) = service().await;
        let tp = service
            .add_trust_point(None, &ca_der("Root CA", None))
            .await
            .unwrap();
        let der = ca_der("Issuing CA", None);

        let report = ColdStartReport {
            parent_issuer: tp.name.clone(),
            certificate_der: hex::encode(&der),
            crl_url: Some("http://crl.example.com/issuing.crl".into()),
        };
        let authority = service
            .complete_cold_start(report.clone())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(authority.trust_point, tp.name);
        assert_eq!(authority.status, AuthorityStatus::Processing);
        assert!(matches!(
            queues.harvester.try_recv().unwrap().message,
            DispatchMessage::Harvest {
                mode: FetchMode::Full,
                ..
            }
        ));

        assert!(service.complete_cold_start(report).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cold_start_rejects_unknown_parent_and_bad_hex() {
        let (service, _queues) = service().await;
        let err = service
            .complete_cold_start(ColdStartReport {
                parent_issuer: "CN=Nobody".into(),
                certificate_der: String::new(),
                crl_url: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::AuthorityNotFound(_)));

        let tp = service
            .add_trust_point(None, &ca_der("Root CA", None))
            .await
            .unwrap();
        let err = service
            .complete_cold_start(ColdStartReport {
                parent_issuer: tp.name,
                certificate_der: "zz".into(),
                crl_url: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidReport(_)));
    }

    #[tokio::test]
    async fn test_removal_report_purges_rows() {
        let (service, _queues) = service().await;
        let tp = service
            .add_trust_point(None, &ca_der("Root CA", Some("http://crl.example.com/r.crl")))
            .await
            .unwrap();
        service
            .complete_harvest(harvest(&tp.name, 1, &[1, 2, 3]))
            .await
            .unwrap();

        service
            .handle_report(WorkerReport::Removed {
                issuer: tp.name.clone(),
            })
            .await
            .unwrap();
        assert!(service.store().authority(&tp.name).await.unwrap().is_none());
        assert!(
            service
                .registry()
                .trust_point(&tp.name)
                .unwrap()
                .authorities
                .is_empty()
        );
    }
}
