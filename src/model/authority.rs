use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_parser::oid_registry::OID_PKIX_ACCESS_DESCRIPTOR_OCSP;
use x509_parser::prelude::*;

use super::revoked::CrlNumber;
use crate::crypto::HashAlg;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Certificate parsing failed: {0}")]
    Parse(String),

    #[error("Certificate is not a CA certificate: {0}")]
    NotCa(String),
}

impl From<x509_parser::nom::Err<X509Error>> for CertificateError {
    fn from(e: x509_parser::nom::Err<X509Error>) -> Self {
        CertificateError::Parse(e.to_string())
    }
}

/// Cache state of a certificate authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorityStatus {
    /// Registered, no CRL merged yet
    Inactive,
    /// A download or harvest is in flight
    Processing,
    /// At least one CRL has been merged
    Active,
    /// No CRL locator; revocation state is never cached
    None,
}

/// The OCSP `CertID` issuer hashes of an authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IssuerHashes {
    /// SHA-1 of the DER encoded subject name
    pub name_hash: [u8; 20],
    /// SHA-1 of the subject public key bits
    pub key_hash: [u8; 20],
}

impl IssuerHashes {
    pub fn new(name_hash: [u8; 20], key_hash: [u8; 20]) -> Self {
        Self {
            name_hash,
            key_hash,
        }
    }

    /// Build from raw hash slices, `None` unless both are exactly 20 bytes.
    pub fn from_slices(name_hash: &[u8], key_hash: &[u8]) -> Option<Self> {
        Some(Self {
            name_hash: name_hash.try_into().ok()?,
            key_hash: key_hash.try_into().ok()?,
        })
    }

    pub fn to_hex(&self) -> String {
        format!(
            "{}:{}",
            hex::encode(self.name_hash),
            hex::encode(self.key_hash)
        )
    }
}

impl fmt::Display for IssuerHashes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// A CA certificate belonging to exactly one trust point chain.
///
/// `name` is the subject DN string and doubles as the issuer key of the
/// revocation rows. `fingerprint` is derived from subject and public key so
/// that re-submitting an equivalent certificate resolves to the same row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateAuthority {
    pub name: String,
    pub trust_point: String,
    pub fingerprint: String,
    pub certificate_der: Vec<u8>,
    pub crl_uri: Option<String>,
    pub ocsp_uri: Option<String>,
    pub hashes: IssuerHashes,
    pub status: AuthorityStatus,
    pub last_crl_number: Option<CrlNumber>,
    pub this_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
    pub not_after: DateTime<Utc>,
}

impl CertificateAuthority {
    /// Parse a DER encoded CA certificate.
    ///
    /// The CRL locator defaults to the first URI of the CRL distribution
    /// points extension unless `crl_uri` overrides it.
    pub fn from_der(
        der: impl AsRef<[u8]>,
        trust_point: impl Into<String>,
        crl_uri: Option<String>,
    ) -> Result<Self, CertificateError> {
        let der = der.as_ref();
        let (_, cert) = X509Certificate::from_der(der)?;

        let subject = cert.subject().to_string();
        if let Ok(Some(bc)) = cert.basic_constraints()
            && !bc.value.ca
        {
            return Err(CertificateError::NotCa(subject));
        }

        let subject_raw = cert.subject().as_raw();
        let spki = cert.public_key();
        let key_bits: &[u8] = &spki.subject_public_key.data;

        let fingerprint = hex::encode(HashAlg::Sha256.hash_parts([subject_raw, spki.raw]));
        let hashes = IssuerHashes::from_slices(
            &HashAlg::Sha1.hash(subject_raw),
            &HashAlg::Sha1.hash(key_bits),
        )
        .ok_or_else(|| CertificateError::Parse("unexpected SHA-1 output size".into()))?;

        let (crl_dp, ocsp_uri) = locators(&cert);
        let crl_uri = crl_uri.or(crl_dp);
        let status = if crl_uri.is_some() {
            AuthorityStatus::Inactive
        } else {
            AuthorityStatus::None
        };
        let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
            .unwrap_or_else(Utc::now);

        Ok(Self {
            name: subject,
            trust_point: trust_point.into(),
            fingerprint,
            certificate_der: der.to_vec(),
            crl_uri,
            ocsp_uri,
            hashes,
            status,
            last_crl_number: None,
            this_update: None,
            next_update: None,
            not_after,
        })
    }

    /// Whether the CA certificate has expired at `at`.
    pub fn is_expired_at(&self, at: DateTime<Utc>) -> bool {
        self.not_after < at
    }

    pub fn has_crl_locator(&self) -> bool {
        self.crl_uri.is_some()
    }
}

/// First CRL distribution point URI and first OCSP responder URI.
fn locators(cert: &X509Certificate<'_>) -> (Option<String>, Option<String>) {
    let mut crl_uri = None;
    let mut ocsp_uri = None;

    for ext in cert.extensions() {
        match ext.parsed_extension() {
            ParsedExtension::CRLDistributionPoints(points) if crl_uri.is_none() => {
                crl_uri = points.iter().find_map(|point| match &point.distribution_point {
                    Some(DistributionPointName::FullName(names)) => {
                        names.iter().find_map(|name| match name {
                            GeneralName::URI(uri) => Some(uri.to_string()),
                            _ => None,
                        })
                    }
                    _ => None,
                });
            }
            ParsedExtension::AuthorityInfoAccess(aia) if ocsp_uri.is_none() => {
                ocsp_uri = aia
                    .iter()
                    .filter(|desc| desc.access_method == OID_PKIX_ACCESS_DESCRIPTOR_OCSP)
                    .find_map(|desc| match &desc.access_location {
                        GeneralName::URI(uri) => Some(uri.to_string()),
                        _ => None,
                    });
            }
            _ => {}
        }
    }

    (crl_uri, ocsp_uri)
}
