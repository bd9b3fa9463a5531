use flowexec_core::TenantId;

use crate::config::ConfigError;
use crate::jobs::JobStoreError;

/// Executor-level error.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// No scheduler is registered for the ambient tenant, or no tenant is ambient.
    #[error("no job executor registered for {}", describe_tenant(.0.as_ref()))]
    UnknownTenant(Option<TenantId>),

    #[error("tenant {0} already has a job executor")]
    DuplicateTenant(TenantId),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    #[error("no command executor configured")]
    MissingCommandExecutor,

    #[error("invalid scheduler configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

fn describe_tenant(tenant_id: Option<&TenantId>) -> String {
    match tenant_id {
        Some(id) => format!("tenant {id}"),
        None => "the current thread (no tenant set)".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tenant_messages() {
        let named = ExecutorError::UnknownTenant(Some(TenantId::new("t9").unwrap()));
        assert_eq!(named.to_string(), "no job executor registered for tenant t9");

        let unset = ExecutorError::UnknownTenant(None);
        assert!(unset.to_string().contains("no tenant set"));
    }
}
