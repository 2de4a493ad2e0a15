#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, CrlDistributionPoint, DistinguishedName, DnType, IsCa,
    KeyPair,
};
use trust_service::{
    audit::{AuditLog, Counters},
    dispatch::{ChannelTransport, Notifier, RetryPolicy, WorkerQueues},
    persistence::JsonFile,
    registry::Registry,
    revocation::MemoryRevocationStore,
    scheduler::{Clock, FireTable, Scheduler, SystemClock},
    service::TrustService,
};

pub type Service = TrustService<MemoryRevocationStore>;

pub struct Harness {
    pub service: Service,
    pub queues: WorkerQueues,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(Arc::new(SystemClock), MemoryRevocationStore::new(), None).await
    }

    pub async fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::build(clock, MemoryRevocationStore::new(), None).await
    }

    /// Harness whose registry and fire times live under `dir`.
    pub async fn persistent(dir: &Path, store: MemoryRevocationStore) -> Self {
        Self::build(Arc::new(SystemClock), store, Some(dir)).await
    }

    async fn build(
        clock: Arc<dyn Clock>,
        store: MemoryRevocationStore,
        dir: Option<&Path>,
    ) -> Self {
        let (registry, table) = match dir {
            Some(dir) => (
                Registry::load(JsonFile::new(dir.join("registry.json")))
                    .await
                    .unwrap(),
                FireTable::on_disk(JsonFile::new(dir.join("fire_times.json"))),
            ),
            None => (Registry::in_memory(), FireTable::volatile()),
        };

        let (transport, queues) = ChannelTransport::new(64);
        let counters = Arc::new(Counters::new());
        let audit = Arc::new(AuditLog::default());
        let notifier = Notifier::new(
            Arc::new(transport),
            RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
                multiplier: 1.0,
            },
            Arc::clone(&counters),
            Arc::clone(&audit),
        );
        let scheduler = Scheduler::new(clock, table).await.unwrap();

        Self {
            service: TrustService::new(store, registry, scheduler, notifier, counters, audit),
            queues,
        }
    }
}

/// Self-signed CA certificate, optionally with a CRL distribution point.
pub fn ca_der(common_name: &str, crl_uri: Option<&str>) -> Vec<u8> {
    let key_pair = KeyPair::generate().unwrap();
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    if let Some(uri) = crl_uri {
        params.crl_distribution_points = vec![CrlDistributionPoint {
            uris: vec![uri.to_string()],
        }];
    }
    params.self_signed(&key_pair).unwrap().der().to_vec()
}
