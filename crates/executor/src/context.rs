//! Tenant context: the ambient "current tenant" at the public boundary and
//! the explicit context threaded through acquisition and execution.
//!
//! Internally nothing reads the ambient tenant. An acquisition loop carries
//! an [`ExecutionContext`] from the cycle to the claim, the submission and the
//! worker. The ambient value is only *established* at thread/task entry (so
//! business logic calling back into the executor resolves the right tenant)
//! and *read* by the multi-tenant router.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use flowexec_core::{LockOwner, TenantId};

/// Source of the ambient tenant for the calling thread.
pub trait TenantContextProvider: Send + Sync {
    fn current_tenant(&self) -> Option<TenantId>;

    /// Replace the current tenant, returning the previous one.
    fn set_current_tenant(&self, tenant_id: Option<TenantId>) -> Option<TenantId>;
}

thread_local! {
    /// Tenant the current thread is working for; `None` outside any scope.
    static CURRENT_TENANT: RefCell<Option<TenantId>> = const { RefCell::new(None) };
}

/// [`TenantContextProvider`] backed by a thread-local slot.
///
/// All instances share the same per-thread slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLocalTenantContext;

impl ThreadLocalTenantContext {
    pub fn new() -> Self {
        Self
    }

    pub fn arc() -> Arc<dyn TenantContextProvider> {
        Arc::new(Self)
    }
}

impl TenantContextProvider for ThreadLocalTenantContext {
    fn current_tenant(&self) -> Option<TenantId> {
        CURRENT_TENANT.with(|c| c.borrow().clone())
    }

    fn set_current_tenant(&self, tenant_id: Option<TenantId>) -> Option<TenantId> {
        CURRENT_TENANT.with(|c| c.replace(tenant_id))
    }
}

/// RAII guard that makes a tenant ambient for the current thread. On drop it
/// restores whatever was ambient before, so a reused worker thread never
/// carries a tenant into unrelated work.
///
/// Not `Send`: it must be dropped on the thread that created it.
#[must_use = "the tenant is only ambient while the scope is alive"]
pub struct TenantScope {
    provider: Arc<dyn TenantContextProvider>,
    previous: Option<TenantId>,
    _not_send: PhantomData<*const ()>,
}

impl TenantScope {
    pub fn enter(provider: Arc<dyn TenantContextProvider>, tenant_id: TenantId) -> Self {
        let previous = provider.set_current_tenant(Some(tenant_id));
        Self {
            provider,
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for TenantScope {
    fn drop(&mut self) {
        self.provider.set_current_tenant(self.previous.take());
    }
}

impl std::fmt::Debug for TenantScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantScope")
            .field("previous", &self.previous)
            .finish_non_exhaustive()
    }
}

/// A scheduler's binding to one tenant.
#[derive(Clone)]
pub struct TenantBinding {
    tenant_id: TenantId,
    provider: Arc<dyn TenantContextProvider>,
}

impl TenantBinding {
    pub fn new(tenant_id: TenantId, provider: Arc<dyn TenantContextProvider>) -> Self {
        Self { tenant_id, provider }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Make the bound tenant ambient until the returned scope is dropped.
    pub fn enter(&self) -> TenantScope {
        TenantScope::enter(self.provider.clone(), self.tenant_id.clone())
    }
}

impl std::fmt::Debug for TenantBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantBinding")
            .field("tenant_id", &self.tenant_id)
            .finish_non_exhaustive()
    }
}

/// Explicit context handed from an acquisition cycle to the job's execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    binding: Option<TenantBinding>,
    lock_owner: LockOwner,
}

impl ExecutionContext {
    pub fn new(binding: Option<TenantBinding>, lock_owner: LockOwner) -> Self {
        Self { binding, lock_owner }
    }

    /// Tenant the executing scheduler is bound to; `None` for an unbound
    /// scheduler serving every tenant.
    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.binding.as_ref().map(TenantBinding::tenant_id)
    }

    pub fn lock_owner(&self) -> &LockOwner {
        &self.lock_owner
    }

    /// Establish the bound tenant as ambient for the current thread.
    pub(crate) fn enter(&self) -> Option<TenantScope> {
        self.binding.as_ref().map(TenantBinding::enter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(name: &str) -> TenantId {
        TenantId::new(name).unwrap()
    }

    #[test]
    fn scope_sets_and_restores_the_ambient_tenant() {
        let provider = ThreadLocalTenantContext::arc();
        assert_eq!(provider.current_tenant(), None);

        {
            let _outer = TenantScope::enter(provider.clone(), tenant("t1"));
            assert_eq!(provider.current_tenant(), Some(tenant("t1")));

            {
                let _inner = TenantScope::enter(provider.clone(), tenant("t2"));
                assert_eq!(provider.current_tenant(), Some(tenant("t2")));
            }

            assert_eq!(provider.current_tenant(), Some(tenant("t1")));
        }

        assert_eq!(provider.current_tenant(), None);
    }

    #[test]
    fn ambient_tenant_does_not_cross_threads() {
        let provider = ThreadLocalTenantContext::arc();
        let _scope = TenantScope::enter(provider.clone(), tenant("t1"));

        let seen = std::thread::spawn(|| ThreadLocalTenantContext.current_tenant())
            .join()
            .unwrap();
        assert_eq!(seen, None);
    }

    #[test]
    fn scope_is_restored_when_work_panics() {
        let provider = ThreadLocalTenantContext::arc();
        let inner = provider.clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _scope = TenantScope::enter(inner, tenant("t1"));
            panic!("job blew up");
        }));

        assert!(result.is_err());
        assert_eq!(provider.current_tenant(), None);
    }

    #[test]
    fn execution_context_exposes_binding() {
        let owner = LockOwner::generate();
        let bound = ExecutionContext::new(
            Some(TenantBinding::new(tenant("t1"), ThreadLocalTenantContext::arc())),
            owner.clone(),
        );
        assert_eq!(bound.tenant_id(), Some(&tenant("t1")));
        assert_eq!(bound.lock_owner(), &owner);

        let unbound = ExecutionContext::new(None, owner);
        assert!(unbound.tenant_id().is_none());
        assert!(unbound.enter().is_none());
    }
}
