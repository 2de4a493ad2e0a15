use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::model::CertificateError;
use crate::persistence::PersistError;
use crate::revocation::StoreError;
use crate::scheduler::SchedulerError;
use crate::trust_domain::DomainError;

/// Errors surfaced at the administrative boundary
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Trust point already exists: {0}")]
    TrustPointAlreadyExists(String),

    #[error("Trust point not found: {0}")]
    TrustPointNotFound(String),

    #[error("Certificate authority not found: {0}")]
    AuthorityNotFound(String),

    #[error("Invalid worker report: {0}")]
    InvalidReport(String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Persist(#[from] PersistError),
}

impl ServiceError {
    /// Whether the failed operation may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Store(e) => e.is_transient(),
            ServiceError::Dispatch(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Type alias for Results using ServiceError
pub type ServiceResult<T> = Result<T, ServiceError>;
