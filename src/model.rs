//! Core data model shared by the revocation store, the scheduler and the
//! administrative service.

mod authority;
mod revoked;
mod timer;
mod trust_point;

pub use authority::{AuthorityStatus, CertificateAuthority, CertificateError, IssuerHashes};
pub use revoked::{CrlNumber, RevokedCertificate, RevokedEntry, SerialNumber};
pub use timer::TimerInfo;
pub use trust_point::{ClockDriftConfig, TimeProtocol, TrustPoint};
