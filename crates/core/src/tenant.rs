use crate::TenantId;

/// Helper trait for tenant-scoped values.
///
/// Marks types that belong to exactly one tenant, so tenant-aware
/// infrastructure (acquisition loops, stores, workers) can check ownership
/// without knowing the concrete type.
///
/// ## Use Cases
///
/// - **Acquisition filtering**: a scheduler bound to a tenant only claims
///   records whose `tenant_id()` matches
/// - **Store isolation**: reads through the wrong tenant are rejected
pub trait TenantScoped {
    fn tenant_id(&self) -> &TenantId;

    /// Whether this value belongs to `tenant_id`.
    fn belongs_to(&self, tenant_id: &TenantId) -> bool {
        self.tenant_id() == tenant_id
    }
}
