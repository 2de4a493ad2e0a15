use std::fmt;

use serde::{Deserialize, Serialize};

use super::errors::{DomainError, DomainResult};
use crate::model::SerialNumber;

/// The nine key usage bits of RFC 5280, section 4.2.1.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
    EncipherOnly,
    DecipherOnly,
}

impl KeyUsage {
    /// Bit position inside the `KeyUsage` BIT STRING.
    pub fn bit(self) -> u8 {
        match self {
            KeyUsage::DigitalSignature => 0,
            KeyUsage::NonRepudiation => 1,
            KeyUsage::KeyEncipherment => 2,
            KeyUsage::DataEncipherment => 3,
            KeyUsage::KeyAgreement => 4,
            KeyUsage::KeyCertSign => 5,
            KeyUsage::CrlSign => 6,
            KeyUsage::EncipherOnly => 7,
            KeyUsage::DecipherOnly => 8,
        }
    }
}

/// Kind specific payload of a certificate constraint.
///
/// Evaluation happens outside this crate; consumers match on the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintKind {
    /// The chain must carry the certificate policy `oid`.
    Policy { oid: String },
    /// The end entity must (or must not) assert `usage`.
    KeyUsage { usage: KeyUsage, allowed: bool },
    /// The end entity subject must equal `dn`.
    Dn { dn: String },
    /// Only the end entity `(issuer, serial)` is accepted.
    EndEntity {
        issuer: String,
        serial_number: SerialNumber,
    },
    /// The end entity must carry a qualified certificate statement.
    Qc,
    /// The end entity must have the time stamping extended key usage.
    Tsa,
}

impl ConstraintKind {
    pub fn name(&self) -> &'static str {
        match self {
            ConstraintKind::Policy { .. } => "policy",
            ConstraintKind::KeyUsage { .. } => "key_usage",
            ConstraintKind::Dn { .. } => "dn",
            ConstraintKind::EndEntity { .. } => "end_entity",
            ConstraintKind::Qc => "qc",
            ConstraintKind::Tsa => "tsa",
        }
    }

    /// Rejects payloads that no evaluator could make sense of.
    pub(crate) fn validate(&self) -> DomainResult<()> {
        match self {
            ConstraintKind::Policy { oid } if !is_dotted_oid(oid) => Err(
                DomainError::InvalidConstraint(format!("not a dotted OID: {oid:?}")),
            ),
            ConstraintKind::Dn { dn } if dn.trim().is_empty() => Err(
                DomainError::InvalidConstraint("empty distinguished name".into()),
            ),
            ConstraintKind::EndEntity { issuer, .. } if issuer.trim().is_empty() => Err(
                DomainError::InvalidConstraint("empty end entity issuer".into()),
            ),
            _ => Ok(()),
        }
    }
}

fn is_dotted_oid(oid: &str) -> bool {
    let arcs: Vec<&str> = oid.split('.').collect();
    arcs.len() >= 2
        && arcs
            .iter()
            .all(|arc| !arc.is_empty() && arc.bytes().all(|b| b.is_ascii_digit()))
}

/// A constraint owned by exactly one trust domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateConstraint {
    pub id: u64,
    pub domain: String,
    #[serde(flatten)]
    pub kind: ConstraintKind,
}

impl fmt::Display for CertificateConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ({})", self.domain, self.id, self.kind.name())
    }
}
