use thiserror::Error;

/// Errors of the constraint configuration store.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DomainError {
    #[error("Trust domain not found: {0}")]
    DomainNotFound(String),

    #[error("Trust domain already exists: {0}")]
    DomainAlreadyExists(String),

    #[error("Trust domain {0} is not virtual")]
    NotVirtual(String),

    #[error("Trust domain {0} is virtual and cannot hold trust points")]
    IsVirtual(String),

    #[error("Adding {member} to {domain} would make {domain} reference itself")]
    CyclicMembership { domain: String, member: String },

    #[error("Constraint {id} not found in trust domain {domain}")]
    ConstraintNotFound { domain: String, id: u64 },

    #[error("Invalid constraint: {0}")]
    InvalidConstraint(String),
}

pub type DomainResult<T> = Result<T, DomainError>;
