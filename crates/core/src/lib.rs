//! Shared building blocks for the job executor.
//!
//! This crate contains **pure** primitives (no threads, no storage).

pub mod error;
pub mod id;
pub mod tenant;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, LockOwner, TenantId};
pub use tenant::TenantScoped;
