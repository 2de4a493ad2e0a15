//! Constraint configuration store.
//!
//! Trust domains group trust points (or, when virtual, other trust domains)
//! and own a list of certificate constraints. Nothing here evaluates a
//! constraint; this module only keeps the configuration consistent.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

mod constraint;
mod errors;

pub use constraint::{CertificateConstraint, ConstraintKind, KeyUsage};
pub use errors::{DomainError, DomainResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustDomain {
    pub name: String,
    /// A virtual domain groups other domains instead of trust points.
    pub virtual_domain: bool,
    pub trust_points: BTreeSet<String>,
    pub members: BTreeSet<String>,
    pub is_default: bool,
    pub use_caching: bool,
    pub constraints: Vec<CertificateConstraint>,
}

impl TrustDomain {
    fn new(name: String, virtual_domain: bool) -> Self {
        Self {
            name,
            virtual_domain,
            trust_points: BTreeSet::new(),
            members: BTreeSet::new(),
            is_default: false,
            use_caching: true,
            constraints: Vec::new(),
        }
    }
}

/// Serializable content of the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustDomainData {
    pub domains: BTreeMap<String, TrustDomain>,
    pub next_constraint_id: u64,
}

impl TrustDomainData {
    fn get_mut(&mut self, name: &str) -> DomainResult<&mut TrustDomain> {
        self.domains
            .get_mut(name)
            .ok_or_else(|| DomainError::DomainNotFound(name.to_string()))
    }

    /// Whether `target` is reachable from `from` through virtual membership.
    fn reaches(&self, from: &str, target: &str) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(name) = stack.pop() {
            if name == target {
                return true;
            }
            if !seen.insert(name) {
                continue;
            }
            if let Some(domain) = self.domains.get(name) {
                stack.extend(domain.members.iter().map(String::as_str));
            }
        }
        false
    }
}

/// In-memory trust domain registry, shared between clones.
#[derive(Debug, Clone, Default)]
pub struct TrustDomainStore {
    data: Arc<RwLock<TrustDomainData>>,
}

impl TrustDomainStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_data(data: TrustDomainData) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    pub async fn snapshot(&self) -> TrustDomainData {
        self.data.read().await.clone()
    }

    /// Creates a domain. The first regular domain becomes the default.
    pub async fn create_domain(&self, name: &str, virtual_domain: bool) -> DomainResult<()> {
        let mut data = self.data.write().await;
        if data.domains.contains_key(name) {
            return Err(DomainError::DomainAlreadyExists(name.to_string()));
        }

        let mut domain = TrustDomain::new(name.to_string(), virtual_domain);
        domain.is_default =
            !virtual_domain && !data.domains.values().any(|domain| domain.is_default);
        data.domains.insert(name.to_string(), domain);
        info!(domain = name, virtual_domain, "Created trust domain");
        Ok(())
    }

    /// Removes a domain with its constraints and every virtual membership.
    pub async fn remove_domain(&self, name: &str) -> DomainResult<TrustDomain> {
        let mut data = self.data.write().await;
        let removed = data
            .domains
            .remove(name)
            .ok_or_else(|| DomainError::DomainNotFound(name.to_string()))?;
        for domain in data.domains.values_mut() {
            domain.members.remove(name);
        }
        info!(domain = name, "Removed trust domain");
        Ok(removed)
    }

    pub async fn domain(&self, name: &str) -> Option<TrustDomain> {
        self.data.read().await.domains.get(name).cloned()
    }

    pub async fn domains(&self) -> Vec<TrustDomain> {
        self.data.read().await.domains.values().cloned().collect()
    }

    pub async fn default_domain(&self) -> Option<TrustDomain> {
        let data = self.data.read().await;
        data.domains.values().find(|d| d.is_default).cloned()
    }

    pub async fn set_default(&self, name: &str) -> DomainResult<()> {
        let mut data = self.data.write().await;
        if !data.domains.contains_key(name) {
            return Err(DomainError::DomainNotFound(name.to_string()));
        }
        for domain in data.domains.values_mut() {
            domain.is_default = domain.name == name;
        }
        Ok(())
    }

    pub async fn set_use_caching(&self, name: &str, use_caching: bool) -> DomainResult<()> {
        self.data.write().await.get_mut(name)?.use_caching = use_caching;
        Ok(())
    }

    pub async fn attach_trust_point(&self, domain: &str, trust_point: &str) -> DomainResult<()> {
        let mut data = self.data.write().await;
        let domain = data.get_mut(domain)?;
        if domain.virtual_domain {
            return Err(DomainError::IsVirtual(domain.name.clone()));
        }
        domain.trust_points.insert(trust_point.to_string());
        Ok(())
    }

    pub async fn detach_trust_point(&self, domain: &str, trust_point: &str) -> DomainResult<bool> {
        Ok(self
            .data
            .write()
            .await
            .get_mut(domain)?
            .trust_points
            .remove(trust_point))
    }

    /// Detaches a trust point from every domain, returning the affected ones.
    pub async fn detach_trust_point_everywhere(&self, trust_point: &str) -> Vec<String> {
        let mut data = self.data.write().await;
        data.domains
            .values_mut()
            .filter_map(|domain| {
                domain
                    .trust_points
                    .remove(trust_point)
                    .then(|| domain.name.clone())
            })
            .collect()
    }

    /// Adds `member` to the virtual domain `domain`.
    ///
    /// Fails with [`DomainError::CyclicMembership`] when `domain` is
    /// reachable from `member`, so no domain ever references itself.
    pub async fn attach_domain(&self, domain: &str, member: &str) -> DomainResult<()> {
        let mut data = self.data.write().await;
        if !data.domains.contains_key(member) {
            return Err(DomainError::DomainNotFound(member.to_string()));
        }
        if !data.get_mut(domain)?.virtual_domain {
            return Err(DomainError::NotVirtual(domain.to_string()));
        }
        if data.reaches(member, domain) {
            return Err(DomainError::CyclicMembership {
                domain: domain.to_string(),
                member: member.to_string(),
            });
        }

        data.get_mut(domain)?.members.insert(member.to_string());
        debug!(domain, member, "Attached trust domain");
        Ok(())
    }

    pub async fn detach_domain(&self, domain: &str, member: &str) -> DomainResult<bool> {
        Ok(self.data.write().await.get_mut(domain)?.members.remove(member))
    }

    /// All trust points of `domain`, following virtual membership.
    pub async fn resolve_trust_points(&self, domain: &str) -> DomainResult<BTreeSet<String>> {
        let data = self.data.read().await;
        if !data.domains.contains_key(domain) {
            return Err(DomainError::DomainNotFound(domain.to_string()));
        }

        let mut trust_points = BTreeSet::new();
        let mut stack = vec![domain];
        let mut seen = BTreeSet::new();
        while let Some(name) = stack.pop() {
            if !seen.insert(name) {
                continue;
            }
            if let Some(domain) = data.domains.get(name) {
                trust_points.extend(domain.trust_points.iter().cloned());
                stack.extend(domain.members.iter().map(String::as_str));
            }
        }
        Ok(trust_points)
    }

    pub async fn add_constraint(
        &self,
        domain: &str,
        kind: ConstraintKind,
    ) -> DomainResult<CertificateConstraint> {
        kind.validate()?;

        let mut data = self.data.write().await;
        data.get_mut(domain)?;
        data.next_constraint_id += 1;
        let constraint = CertificateConstraint {
            id: data.next_constraint_id,
            domain: domain.to_string(),
            kind,
        };
        data.get_mut(domain)?.constraints.push(constraint.clone());
        debug!(%constraint, "Added constraint");
        Ok(constraint)
    }

    pub async fn remove_constraint(
        &self,
        domain: &str,
        id: u64,
    ) -> DomainResult<CertificateConstraint> {
        let mut data = self.data.write().await;
        let owner = data.get_mut(domain)?;
        let position = owner
            .constraints
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| DomainError::ConstraintNotFound {
                domain: domain.to_string(),
                id,
            })?;
        Ok(owner.constraints.remove(position))
    }

    pub async fn constraints(&self, domain: &str) -> DomainResult<Vec<CertificateConstraint>> {
        let data = self.data.read().await;
        data.domains
            .get(domain)
            .map(|d| d.constraints.clone())
            .ok_or_else(|| DomainError::DomainNotFound(domain.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(regular: &[&str], virtuals: &[&str]) -> TrustDomainStore {
        let store = TrustDomainStore::new();
        for name in regular {
            store.create_domain(name, false).await.unwrap();
        }
        for name in virtuals {
            store.create_domain(name, true).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_first_regular_domain_is_default() {
        let store = store_with(&["BE", "EU"], &["ALL"]).await;
        assert_eq!(store.default_domain().await.unwrap().name, "BE");

        store.set_default("EU").await.unwrap();
        let defaults: Vec<_> = store
            .domains()
            .await
            .into_iter()
            .filter(|d| d.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].name, "EU");
    }

    #[tokio::test]
    async fn test_duplicate_domain_rejected() {
        let store = store_with(&["BE"], &[]).await;
        assert_eq!(
            store.create_domain("BE", true).await,
            Err(DomainError::DomainAlreadyExists("BE".into()))
        );
    }

    #[tokio::test]
    async fn test_virtual_cycle_rejected() {
        let store = store_with(&["BE"], &["A", "B", "C"]).await;
        store.attach_domain("A", "B").await.unwrap();
        store.attach_domain("B", "C").await.unwrap();
        store.attach_domain("C", "BE").await.unwrap();

        let err = store.attach_domain("C", "A").await.unwrap_err();
        assert!(matches!(err, DomainError::CyclicMembership { .. }));
        let err = store.attach_domain("A", "A").await.unwrap_err();
        assert!(matches!(err, DomainError::CyclicMembership { .. }));

        assert!(!store.domain("C").await.unwrap().members.contains("A"));
    }

    #[tokio::test]
    async fn test_membership_kind_enforced() {
        let store = store_with(&["BE", "NL"], &["ALL"]).await;
        assert_eq!(
            store.attach_domain("BE", "NL").await,
            Err(DomainError::NotVirtual("BE".into()))
        );
        assert_eq!(
            store.attach_trust_point("ALL", "root").await,
            Err(DomainError::IsVirtual("ALL".into()))
        );
    }

    #[tokio::test]
    async fn test_resolve_follows_virtual_domains() {
        let store = store_with(&["BE", "NL"], &["BENELUX", "ALL"]).await;
        store.attach_trust_point("BE", "be-root").await.unwrap();
        store.attach_trust_point("NL", "nl-root").await.unwrap();
        store.attach_domain("BENELUX", "BE").await.unwrap();
        store.attach_domain("BENELUX", "NL").await.unwrap();
        store.attach_domain("ALL", "BENELUX").await.unwrap();

        let resolved = store.resolve_trust_points("ALL").await.unwrap();
        assert_eq!(
            resolved.into_iter().collect::<Vec<_>>(),
            vec!["be-root".to_string(), "nl-root".to_string()]
        );
    }

    #[tokio::test]
    async fn test_remove_domain_cascades() {
        let store = store_with(&["BE"], &["ALL"]).await;
        store.attach_domain("ALL", "BE").await.unwrap();
        store
            .add_constraint("BE", ConstraintKind::Qc)
            .await
            .unwrap();

        let removed = store.remove_domain("BE").await.unwrap();
        assert_eq!(removed.constraints.len(), 1);
        assert!(store.domain("ALL").await.unwrap().members.is_empty());
        assert!(store.default_domain().await.is_none());
    }

    #[tokio::test]
    async fn test_constraint_crud() {
        let store = store_with(&["BE"], &[]).await;
        let policy = store
            .add_constraint(
                "BE",
                ConstraintKind::Policy {
                    oid: "2.16.56.1.1.1.2.1".into(),
                },
            )
            .await
            .unwrap();
        let tsa = store.add_constraint("BE", ConstraintKind::Tsa).await.unwrap();
        assert_ne!(policy.id, tsa.id);

        assert_eq!(store.constraints("BE").await.unwrap().len(), 2);
        store.remove_constraint("BE", policy.id).await.unwrap();
        assert_eq!(store.constraints("BE").await.unwrap(), vec![tsa]);

        assert_eq!(
            store.remove_constraint("BE", policy.id).await,
            Err(DomainError::ConstraintNotFound {
                domain: "BE".into(),
                id: policy.id
            })
        );
        assert!(matches!(
            store
                .add_constraint("BE", ConstraintKind::Dn { dn: " ".into() })
                .await,
            Err(DomainError::InvalidConstraint(_))
        ));
    }

    #[tokio::test]
    async fn test_detach_trust_point_everywhere() {
        let store = store_with(&["BE", "NL"], &[]).await;
        store.attach_trust_point("BE", "root").await.unwrap();
        store.attach_trust_point("NL", "root").await.unwrap();

        let affected = store.detach_trust_point_everywhere("root").await;
        assert_eq!(affected, vec!["BE".to_string(), "NL".to_string()]);
        assert!(store.domain("BE").await.unwrap().trust_points.is_empty());
    }
}
