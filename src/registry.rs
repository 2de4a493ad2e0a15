//! Trust point registry.
//!
//! Trust points, trust domains and the clock drift settings are small and
//! change only through administrative calls, so they are kept in memory and
//! written out as one JSON snapshot after each change.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::model::{ClockDriftConfig, TrustPoint};
use crate::persistence::{JsonFile, PersistResult};
use crate::trust_domain::{TrustDomainData, TrustDomainStore};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub trust_points: Vec<TrustPoint>,
    #[serde(default)]
    pub domains: TrustDomainData,
    #[serde(default)]
    pub clock_drift: Option<ClockDriftConfig>,
}

#[derive(Debug, Clone)]
pub struct Registry {
    trust_points: Arc<DashMap<String, TrustPoint>>,
    domains: TrustDomainStore,
    clock_drift: Arc<RwLock<Option<ClockDriftConfig>>>,
    file: Option<JsonFile>,
    save_lock: Arc<Mutex<()>>,
}

impl Registry {
    /// A registry that is never written to disk.
    pub fn in_memory() -> Self {
        Self::from_snapshot(RegistrySnapshot::default(), None)
    }

    /// Loads the snapshot at `file`, starting empty when there is none.
    pub async fn load(file: JsonFile) -> PersistResult<Self> {
        let snapshot: RegistrySnapshot = file.load().await?.unwrap_or_default();
        info!(
            "Loaded registry with {} trust points and {} trust domains",
            snapshot.trust_points.len(),
            snapshot.domains.domains.len()
        );
        Ok(Self::from_snapshot(snapshot, Some(file)))
    }

    fn from_snapshot(snapshot: RegistrySnapshot, file: Option<JsonFile>) -> Self {
        let trust_points = snapshot
            .trust_points
            .into_iter()
            .map(|tp| (tp.name.clone(), tp))
            .collect();
        Self {
            trust_points: Arc::new(trust_points),
            domains: TrustDomainStore::from_data(snapshot.domains),
            clock_drift: Arc::new(RwLock::new(snapshot.clock_drift)),
            file,
            save_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn snapshot(&self) -> RegistrySnapshot {
        let mut trust_points: Vec<TrustPoint> = self
            .trust_points
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        trust_points.sort_by(|a, b| a.name.cmp(&b.name));

        RegistrySnapshot {
            trust_points,
            domains: self.domains.snapshot().await,
            clock_drift: self.clock_drift.read().await.clone(),
        }
    }

    /// Writes the current state; saves are serialized so the newest wins.
    pub async fn save(&self) -> PersistResult<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let _guard = self.save_lock.lock().await;
        file.save(&self.snapshot().await).await
    }

    pub fn trust_point(&self, name: &str) -> Option<TrustPoint> {
        self.trust_points.get(name).map(|tp| tp.value().clone())
    }

    pub fn trust_points(&self) -> Vec<TrustPoint> {
        let mut trust_points: Vec<_> = self
            .trust_points
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        trust_points.sort_by(|a, b| a.name.cmp(&b.name));
        trust_points
    }

    /// Inserts a new trust point; `false` if the name is taken.
    pub fn insert_trust_point(&self, trust_point: TrustPoint) -> bool {
        match self.trust_points.entry(trust_point.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(trust_point);
                true
            }
        }
    }

    /// Applies `update` to an existing trust point and returns the result.
    pub fn update_trust_point(
        &self,
        name: &str,
        update: impl FnOnce(&mut TrustPoint),
    ) -> Option<TrustPoint> {
        let mut entry = self.trust_points.get_mut(name)?;
        update(entry.value_mut());
        Some(entry.value().clone())
    }

    pub fn remove_trust_point(&self, name: &str) -> Option<TrustPoint> {
        self.trust_points.remove(name).map(|(_, tp)| tp)
    }

    pub fn domains(&self) -> &TrustDomainStore {
        &self.domains
    }

    pub async fn clock_drift(&self) -> Option<ClockDriftConfig> {
        self.clock_drift.read().await.clone()
    }

    pub async fn set_clock_drift(&self, config: Option<ClockDriftConfig>) {
        *self.clock_drift.write().await = config;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_survives_reload() {
        let dir = TempDir::new().unwrap();
        let file = JsonFile::new(dir.path().join("registry.json"));

        let registry = Registry::load(file.clone()).await.unwrap();
        assert!(registry.insert_trust_point(TrustPoint::new("CN=Root", None)));
        registry.domains().create_domain("BE", false).await.unwrap();
        registry
            .domains()
            .attach_trust_point("BE", "CN=Root")
            .await
            .unwrap();
        registry
            .set_clock_drift(Some(ClockDriftConfig::default()))
            .await;
        registry.save().await.unwrap();

        let reloaded = Registry::load(file).await.unwrap();
        assert_eq!(reloaded.snapshot().await, registry.snapshot().await);
        assert!(
            reloaded
                .domains()
                .domain("BE")
                .await
                .unwrap()
                .trust_points
                .contains("CN=Root")
        );
    }

    #[tokio::test]
    async fn test_duplicate_trust_point_rejected() {
        let registry = Registry::in_memory();
        assert!(registry.insert_trust_point(TrustPoint::new("CN=Root", None)));
        assert!(!registry.insert_trust_point(TrustPoint::new("CN=Root", Some("0 0 0 * * *".into()))));
        assert_eq!(registry.trust_point("CN=Root").unwrap().crl_refresh_cron, None);
    }

    #[tokio::test]
    async fn test_update_and_remove() {
        let registry = Registry::in_memory();
        registry.insert_trust_point(TrustPoint::new("CN=Root", None));

        let updated = registry
            .update_trust_point("CN=Root", |tp| tp.caching_enabled = false)
            .unwrap();
        assert!(!updated.caching_enabled);
        assert!(registry.update_trust_point("CN=Other", |_| {}).is_none());

        assert!(registry.remove_trust_point("CN=Root").is_some());
        assert!(registry.trust_points().is_empty());
        registry.save().await.unwrap();
    }
}
