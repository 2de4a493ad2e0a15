//! Administrative boundary of the trust service.
//!
//! [`TrustService`] owns the collaborators (revocation store, registry,
//! scheduler, notifier) and is the only place that changes more than one of
//! them in a single operation. It is also the scheduler's fire handler: a due
//! trust point timer turns into harvest requests, a due clock drift timer into
//! a probe.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

mod clock_drift;
mod errors;
mod intake;

#[cfg(test)]
pub use clock_drift::MockClockDriftProbe;
pub use clock_drift::{ClockDriftProbe, ProbeError, UnconfiguredProbe};
pub use errors::{ServiceError, ServiceResult};

use crate::audit::{AuditCategory, AuditLog, Counters};
use crate::dispatch::{FetchMode, Notifier};
use crate::model::{
    AuthorityStatus, CertificateAuthority, ClockDriftConfig, TimerInfo, TrustPoint,
};
use crate::registry::Registry;
use crate::revocation::RevocationStore;
use crate::scheduler::{FireHandler, Reschedule, Scheduler, SchedulerError};
use crate::trust_domain::{CertificateConstraint, ConstraintKind, DomainResult};

#[derive(Clone)]
pub struct TrustService<S: RevocationStore> {
    store: S,
    registry: Registry,
    scheduler: Scheduler,
    notifier: Notifier,
    counters: Arc<Counters>,
    audit: Arc<AuditLog>,
    probe: Arc<dyn ClockDriftProbe>,
    /// Cron used for new trust points added without one
    default_cron: Option<String>,
}

impl<S: RevocationStore> TrustService<S> {
    pub fn new(
        store: S,
        registry: Registry,
        scheduler: Scheduler,
        notifier: Notifier,
        counters: Arc<Counters>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            store,
            registry,
            scheduler,
            notifier,
            counters,
            audit,
            probe: Arc::new(UnconfiguredProbe),
            default_cron: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ClockDriftProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_default_cron(mut self, cron: Option<String>) -> Self {
        self.default_cron = cron;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Trims `cron`, treats blank as unset, and rejects unparsable input.
    fn validate_cron(&self, cron: Option<&str>) -> ServiceResult<Option<String>> {
        let Some(cron) = cron.map(str::trim).filter(|cron| !cron.is_empty()) else {
            return Ok(None);
        };
        self.scheduler.parse_cron(cron)?;
        Ok(Some(cron.to_string()))
    }

    /// Registers a root CA as a new trust point and arms its refresh timer.
    ///
    /// Nothing is created when the cron expression is invalid or the
    /// certificate is already known.
    pub async fn add_trust_point(
        &self,
        cron: Option<&str>,
        certificate_der: &[u8],
    ) -> ServiceResult<TrustPoint> {
        let cron = match self.validate_cron(cron)? {
            Some(cron) => Some(cron),
            None => self.validate_cron(self.default_cron.as_deref())?,
        };

        let mut authority = CertificateAuthority::from_der(certificate_der, "", None)?;
        authority.trust_point = authority.name.clone();
        let name = authority.name.clone();

        if self.registry.trust_point(&name).is_some()
            || self.store.authority(&name).await?.is_some()
            || self.store.resolve_issuer(&authority.hashes).await?.is_some()
        {
            return Err(ServiceError::TrustPointAlreadyExists(name));
        }

        let trust_point = TrustPoint::new(name.clone(), cron.clone());
        if !self.registry.insert_trust_point(trust_point.clone()) {
            return Err(ServiceError::TrustPointAlreadyExists(name));
        }
        if let Err(e) = self.store.register_authority(authority).await {
            self.registry.remove_trust_point(&name);
            return Err(e.into());
        }
        self.registry.save().await?;

        if let Some(cron) = &cron {
            self.scheduler
                .start_timer(TimerInfo::trust_point(&name), cron, Reschedule::Keep)
                .await?;
        }
        self.audit
            .record(AuditCategory::Admin, format!("Added trust point {name}"));
        Ok(trust_point)
    }

    /// Updates the refresh schedule and caching flag of a trust point.
    ///
    /// A `None` or blank cron disables the refresh timer.
    pub async fn save_trust_point(
        &self,
        name: &str,
        cron: Option<&str>,
        caching_enabled: bool,
    ) -> ServiceResult<TrustPoint> {
        let cron = self.validate_cron(cron)?;
        let updated = self
            .registry
            .update_trust_point(name, |tp| {
                tp.crl_refresh_cron = cron.clone();
                tp.caching_enabled = caching_enabled;
            })
            .ok_or_else(|| ServiceError::TrustPointNotFound(name.to_string()))?;
        self.registry.save().await?;

        let key = TimerInfo::trust_point(name);
        match &cron {
            Some(cron) => {
                self.scheduler
                    .start_timer(key, cron, Reschedule::Replace)
                    .await?;
            }
            None => {
                self.scheduler.cancel_timers(key).await;
            }
        }
        self.audit.record(
            AuditCategory::Admin,
            format!("Saved trust point {name} (cron {cron:?}, caching {caching_enabled})"),
        );
        Ok(updated)
    }

    /// Removes a trust point together with the cached state of its chain.
    ///
    /// The chain is purged in-process before `RemoveCA` tells the harvester
    /// to drop its own work for those issuers, so a late harvest is rejected
    /// whether or not a worker is attached.
    pub async fn remove_trust_point(&self, name: &str) -> ServiceResult<()> {
        if self.registry.trust_point(name).is_none() {
            return Err(ServiceError::TrustPointNotFound(name.to_string()));
        }
        self.scheduler
            .cancel_timers(TimerInfo::trust_point(name))
            .await;

        for authority in self.chain(name).await? {
            self.complete_removal(&authority.name).await?;
            if let Err(e) = self.notifier.notify_remove_ca(&authority.name).await {
                warn!(issuer = %authority.name, "RemoveCA not delivered: {e}");
            }
        }

        let domains = self
            .registry
            .domains()
            .detach_trust_point_everywhere(name)
            .await;
        self.registry.remove_trust_point(name);
        self.registry.save().await?;

        self.audit.record(
            AuditCategory::Admin,
            format!("Removed trust point {name} (detached from {} domains)", domains.len()),
        );
        Ok(())
    }

    /// Registers an intermediate CA under an existing trust point and
    /// requests its first full harvest. Already known CAs are returned as is.
    pub async fn add_intermediate(
        &self,
        trust_point: &str,
        certificate_der: &[u8],
        crl_uri: Option<String>,
    ) -> ServiceResult<CertificateAuthority> {
        let owner = self
            .registry
            .trust_point(trust_point)
            .ok_or_else(|| ServiceError::TrustPointNotFound(trust_point.to_string()))?;

        let authority = CertificateAuthority::from_der(certificate_der, trust_point, crl_uri)?;
        if let Some(existing) = self.store.authority(&authority.name).await? {
            debug!(issuer = %existing.name, "Intermediate already registered");
            return Ok(existing);
        }
        self.register_in_chain(&owner, authority).await
    }

    /// Stores `authority` as part of the chain of `owner` and dispatches a
    /// full harvest when it has a CRL locator.
    async fn register_in_chain(
        &self,
        owner: &TrustPoint,
        mut authority: CertificateAuthority,
    ) -> ServiceResult<CertificateAuthority> {
        authority.trust_point = owner.name.clone();
        if authority.has_crl_locator() {
            authority.status = AuthorityStatus::Processing;
        }
        self.store.register_authority(authority.clone()).await?;

        self.registry.update_trust_point(&owner.name, |tp| {
            if !tp.authorities.contains(&authority.name) {
                tp.authorities.push(authority.name.clone());
            }
        });
        self.registry.save().await?;
        self.audit.record(
            AuditCategory::Admin,
            format!("Registered {} under trust point {}", authority.name, owner.name),
        );

        if let (true, Some(crl_uri)) = (owner.caching_enabled, authority.crl_uri.as_deref()) {
            // An undelivered request is retried by the next timer fire.
            if let Err(e) = self
                .notifier
                .notify_harvester(&authority.name, crl_uri, FetchMode::Full)
                .await
            {
                warn!(issuer = %authority.name, "Initial harvest not dispatched: {e}");
            }
        }
        Ok(authority)
    }

    /// Fires the refresh of `name` right away.
    ///
    /// Trust points without a schedule are harvested directly.
    pub async fn refresh_now(&self, name: &str) -> ServiceResult<()> {
        if self.registry.trust_point(name).is_none() {
            return Err(ServiceError::TrustPointNotFound(name.to_string()));
        }
        match self
            .scheduler
            .start_timer_now(&TimerInfo::trust_point(name))
            .await
        {
            Ok(()) => Ok(()),
            Err(SchedulerError::UnknownTimer(_)) => {
                self.harvest_trust_point(name).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Asks the downloader to fetch a CA certificate and its CRL.
    pub async fn cold_start(&self, crl_url: &str, cert_url: &str) -> ServiceResult<Uuid> {
        let id = self.notifier.notify_cold_start(crl_url, cert_url).await?;
        self.audit.record(
            AuditCategory::Admin,
            format!("Requested cold start of {cert_url}"),
        );
        Ok(id)
    }

    /// Replaces the clock drift job settings; `None` disables the job.
    pub async fn set_clock_drift(&self, config: Option<ClockDriftConfig>) -> ServiceResult<()> {
        let cron = match &config {
            Some(config) => self.validate_cron(config.cron.as_deref())?,
            None => None,
        };
        self.registry.set_clock_drift(config).await;
        self.registry.save().await?;

        match &cron {
            Some(cron) => {
                self.scheduler
                    .start_timer(TimerInfo::ClockDrift, cron, Reschedule::Replace)
                    .await?;
            }
            None => {
                self.scheduler.cancel_timers(TimerInfo::ClockDrift).await;
            }
        }
        self.audit.record(
            AuditCategory::Admin,
            format!("Clock drift job schedule set to {cron:?}"),
        );
        Ok(())
    }

    /// Re-arms every configured timer after a restart and returns how many
    /// were armed.
    ///
    /// Persisted fire times still in the future are kept. A timer that
    /// cannot be armed is reported and skipped.
    pub async fn rehydrate(&self) -> usize {
        let mut timers: Vec<(TimerInfo, String)> = self
            .registry
            .trust_points()
            .into_iter()
            .filter_map(|tp| {
                let cron = tp.cron()?.to_string();
                Some((TimerInfo::TrustPoint(tp.name), cron))
            })
            .collect();
        if let Some(cron) = self
            .registry
            .clock_drift()
            .await
            .and_then(|config| config.cron)
            .filter(|cron| !cron.trim().is_empty())
        {
            timers.push((TimerInfo::ClockDrift, cron));
        }

        let mut armed = 0;
        for (key, cron) in timers {
            match self
                .scheduler
                .start_timer(key.clone(), &cron, Reschedule::Keep)
                .await
            {
                Ok(_) => armed += 1,
                Err(e) => self
                    .audit
                    .failure(AuditCategory::Admin, format!("Timer {key} not armed: {e}")),
            }
        }
        info!("Rehydrated {armed} timers");
        armed
    }

    /// Certificate authorities registered under trust point `name`.
    async fn chain(&self, name: &str) -> ServiceResult<Vec<CertificateAuthority>> {
        Ok(self
            .store
            .authorities()
            .await?
            .into_iter()
            .filter(|authority| authority.trust_point == name)
            .collect())
    }

    /// Requests a CRL harvest for every cacheable CA of trust point `name`
    /// and returns how many requests were sent.
    pub async fn harvest_trust_point(&self, name: &str) -> ServiceResult<usize> {
        let Some(trust_point) = self.registry.trust_point(name) else {
            warn!(trust_point = name, "Refresh for unknown trust point ignored");
            return Ok(0);
        };
        if !trust_point.caching_enabled {
            debug!(trust_point = name, "Caching disabled, nothing to harvest");
            return Ok(0);
        }

        let now = self.scheduler.now();
        let mut sent = 0;
        for authority in self.chain(name).await? {
            let Some(crl_uri) = authority.crl_uri.as_deref() else {
                continue;
            };
            if authority.status == AuthorityStatus::None || authority.is_expired_at(now) {
                debug!(issuer = %authority.name, "Skipping harvest");
                continue;
            }
            let mode = if authority.status == AuthorityStatus::Active {
                FetchMode::Incremental
            } else {
                FetchMode::Full
            };
            match self
                .notifier
                .notify_harvester(&authority.name, crl_uri, mode)
                .await
            {
                Ok(_) => sent += 1,
                Err(e) => error!(issuer = %authority.name, "Harvest not dispatched: {e}"),
            }
        }
        debug!(trust_point = name, sent, "Harvest requests sent");
        Ok(sent)
    }

    /// Runs the clock drift probe once and returns the measured offset.
    ///
    /// Offsets beyond the tolerance and probe failures are recorded, never
    /// returned as errors.
    pub async fn check_clock_drift(&self) -> Option<TimeDelta> {
        let config = self.registry.clock_drift().await?;
        match self.probe.offset(&config).await {
            Ok(offset) => {
                if clock_drift::exceeds_tolerance(&config, offset) {
                    self.counters.clock_drift_alarm();
                    self.audit.failure(
                        AuditCategory::ClockDrift,
                        format!(
                            "Clock offset {offset} against {} exceeds {:?}",
                            config.server, config.max_clock_offset
                        ),
                    );
                } else {
                    debug!(%offset, server = %config.server, "Clock within tolerance");
                }
                Some(offset)
            }
            Err(e) => {
                self.audit
                    .failure(AuditCategory::ClockDrift, e.to_string());
                None
            }
        }
    }

    async fn persisted<T>(&self, result: DomainResult<T>) -> ServiceResult<T> {
        let value = result?;
        self.registry.save().await?;
        Ok(value)
    }

    pub async fn create_trust_domain(&self, name: &str, virtual_domain: bool) -> ServiceResult<()> {
        let result = self
            .registry
            .domains()
            .create_domain(name, virtual_domain)
            .await;
        self.persisted(result).await
    }

    pub async fn remove_trust_domain(&self, name: &str) -> ServiceResult<()> {
        let result = self.registry.domains().remove_domain(name).await;
        self.persisted(result).await.map(|_| ())
    }

    pub async fn set_default_trust_domain(&self, name: &str) -> ServiceResult<()> {
        let result = self.registry.domains().set_default(name).await;
        self.persisted(result).await
    }

    pub async fn set_trust_domain_caching(&self, name: &str, use_caching: bool) -> ServiceResult<()> {
        let result = self
            .registry
            .domains()
            .set_use_caching(name, use_caching)
            .await;
        self.persisted(result).await
    }

    pub async fn add_trust_point_to_domain(&self, domain: &str, trust_point: &str) -> ServiceResult<()> {
        if self.registry.trust_point(trust_point).is_none() {
            return Err(ServiceError::TrustPointNotFound(trust_point.to_string()));
        }
        let result = self
            .registry
            .domains()
            .attach_trust_point(domain, trust_point)
            .await;
        self.persisted(result).await
    }

    pub async fn remove_trust_point_from_domain(
        &self,
        domain: &str,
        trust_point: &str,
    ) -> ServiceResult<bool> {
        let result = self
            .registry
            .domains()
            .detach_trust_point(domain, trust_point)
            .await;
        self.persisted(result).await
    }

    pub async fn add_domain_member(&self, virtual_domain: &str, member: &str) -> ServiceResult<()> {
        let result = self
            .registry
            .domains()
            .attach_domain(virtual_domain, member)
            .await;
        self.persisted(result).await
    }

    pub async fn remove_domain_member(
        &self,
        virtual_domain: &str,
        member: &str,
    ) -> ServiceResult<bool> {
        let result = self
            .registry
            .domains()
            .detach_domain(virtual_domain, member)
            .await;
        self.persisted(result).await
    }

    pub async fn add_constraint(
        &self,
        domain: &str,
        kind: ConstraintKind,
    ) -> ServiceResult<CertificateConstraint> {
        let result = self.registry.domains().add_constraint(domain, kind).await;
        self.persisted(result).await
    }

    pub async fn remove_constraint(
        &self,
        domain: &str,
        id: u64,
    ) -> ServiceResult<CertificateConstraint> {
        let result = self.registry.domains().remove_constraint(domain, id).await;
        self.persisted(result).await
    }
}

#[async_trait]
impl<S: RevocationStore> FireHandler for TrustService<S> {
    async fn fire(&self, key: TimerInfo) {
        self.counters.timer_fired();
        match &key {
            TimerInfo::TrustPoint(name) => {
                if let Err(e) = self.harvest_trust_point(name).await {
                    self.audit
                        .failure(AuditCategory::Harvest, format!("Refresh of {name} failed: {e}"));
                }
            }
            TimerInfo::ClockDrift => {
                self.check_clock_drift().await;
            }
        }
    }
}
