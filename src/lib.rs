pub mod audit;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod model;
pub mod persistence;
pub mod registry;
pub mod revocation;
pub mod scheduler;
pub mod service;
pub mod telemetry;
pub mod trust_domain;
pub mod validation;
