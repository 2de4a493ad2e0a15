use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use x509_parser::num_bigint::BigUint;

/// Width of the zero padded decimal form of a CRL number.
///
/// RFC 5280 caps CRL numbers at 20 octets, which is at most 49 decimal digits.
pub(crate) const CRL_NUMBER_DIGITS: usize = 49;

macro_rules! decimal_newtype {
    ($name:ident, $what:literal) => {
        impl $name {
            pub fn new(value: impl Into<BigUint>) -> Self {
                Self(value.into())
            }

            /// Build from the big-endian magnitude of an ASN.1 INTEGER.
            pub fn from_bytes_be(bytes: &[u8]) -> Self {
                Self(BigUint::from_bytes_be(bytes))
            }

            pub fn as_biguint(&self) -> &BigUint {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                BigUint::parse_bytes(s.trim().as_bytes(), 10)
                    .map(Self)
                    .ok_or_else(|| format!("invalid {}: {s:?}", $what))
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(BigUint::from(value))
            }
        }

        impl From<u128> for $name {
            fn from(value: u128) -> Self {
                Self(BigUint::from(value))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0.to_str_radix(10))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(de::Error::custom)
            }
        }
    };
}

/// Certificate serial number, an arbitrary precision non-negative integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNumber(BigUint);

decimal_newtype!(SerialNumber, "serial number");

/// Monotonically increasing CRL sequence number of one issuer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrlNumber(BigUint);

decimal_newtype!(CrlNumber, "CRL number");

impl CrlNumber {
    /// Fixed width decimal form; lexicographic order equals numeric order.
    pub fn to_padded(&self) -> String {
        format!("{:0>width$}", self.0.to_str_radix(10), width = CRL_NUMBER_DIGITS)
    }
}

/// One revoked serial as reported by a freshly parsed CRL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevokedEntry {
    pub serial_number: SerialNumber,
    pub revocation_date: DateTime<Utc>,
}

impl RevokedEntry {
    pub fn new(serial_number: impl Into<SerialNumber>, revocation_date: DateTime<Utc>) -> Self {
        Self {
            serial_number: serial_number.into(),
            revocation_date,
        }
    }
}

/// A cached revocation row, unique on `(issuer, serial_number)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedCertificate {
    pub issuer: String,
    pub serial_number: SerialNumber,
    pub revocation_date: DateTime<Utc>,
    pub crl_number: CrlNumber,
}

impl RevokedCertificate {
    pub fn new(
        issuer: impl Into<String>,
        serial_number: impl Into<SerialNumber>,
        revocation_date: DateTime<Utc>,
        crl_number: impl Into<CrlNumber>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            serial_number: serial_number.into(),
            revocation_date,
            crl_number: crl_number.into(),
        }
    }
}
