//! Command execution: the business logic a claimed job runs through.

use std::collections::HashMap;

use crate::context::ExecutionContext;
use crate::jobs::{JobRecord, JobResult};

/// Runs a claimed job's business logic (transactionally, in a real engine).
///
/// Supplied once to the multi-tenant executor and propagated to every
/// per-tenant scheduler. The context tells the implementation which tenant
/// the executing scheduler is bound to.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, job: &JobRecord, context: &ExecutionContext) -> JobResult;
}

impl<F> CommandExecutor for F
where
    F: Fn(&JobRecord, &ExecutionContext) -> JobResult + Send + Sync,
{
    fn execute(&self, job: &JobRecord, context: &ExecutionContext) -> JobResult {
        self(job, context)
    }
}

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&JobRecord, &ExecutionContext) -> JobResult + Send + Sync>;

/// [`CommandExecutor`] routing jobs to handlers by `handler_type`.
///
/// Lookup order: exact match, then category patterns (`"mail.*"` matches
/// `"mail.send"`), then the `"*"` wildcard.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a handler type or pattern.
    pub fn register<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&JobRecord, &ExecutionContext) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Box::new(handler));
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&JobRecord, &ExecutionContext) -> JobResult + Send + Sync + 'static,
    {
        self.register(pattern, handler);
        self
    }

    fn handler_for(&self, handler_type: &str) -> Option<&JobHandler> {
        if let Some(h) = self.handlers.get(handler_type) {
            return Some(h);
        }

        self.handlers
            .iter()
            .filter_map(|(pattern, handler)| {
                let prefix = pattern.strip_suffix(".*")?;
                handler_type
                    .strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), handler))
            })
            // Most specific category wins.
            .max_by_key(|(len, _)| *len)
            .map(|(_, handler)| handler)
            .or_else(|| self.handlers.get("*"))
    }
}

impl CommandExecutor for HandlerRegistry {
    fn execute(&self, job: &JobRecord, context: &ExecutionContext) -> JobResult {
        match self.handler_for(&job.handler_type) {
            Some(handler) => handler(job, context),
            None => JobResult::Failure(format!("no handler for job type: {}", job.handler_type)),
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<_> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("HandlerRegistry")
            .field("patterns", &patterns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowexec_core::{LockOwner, TenantId};

    fn job(handler_type: &str) -> JobRecord {
        JobRecord::async_continuation(TenantId::new("acme").unwrap(), handler_type, serde_json::json!({}))
    }

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(None, LockOwner::generate())
    }

    #[test]
    fn exact_match_wins() {
        let registry = HandlerRegistry::new()
            .with("mail.send", |_, _| JobResult::Success)
            .with("mail.*", |_, _| JobResult::Failure("category".into()));

        assert_eq!(registry.execute(&job("mail.send"), &ctx()), JobResult::Success);
    }

    #[test]
    fn category_handler() {
        let registry = HandlerRegistry::new()
            .with("ai.*", |_, _| JobResult::Success)
            .with("ai.vision.*", |_, _| JobResult::RetryNow);

        assert_eq!(registry.execute(&job("ai.inventory_anomaly"), &ctx()), JobResult::Success);
        assert_eq!(registry.execute(&job("ai.vision.ocr"), &ctx()), JobResult::RetryNow);
        // A category needs the dot separator.
        assert!(matches!(registry.execute(&job("aix"), &ctx()), JobResult::Failure(_)));
    }

    #[test]
    fn wildcard_handler() {
        let registry = HandlerRegistry::new().with("*", |_, _| JobResult::Success);
        assert_eq!(registry.execute(&job("anything"), &ctx()), JobResult::Success);
    }

    #[test]
    fn missing_handler_fails_the_job() {
        let registry = HandlerRegistry::new();
        assert_eq!(
            registry.execute(&job("timer.reminder"), &ctx()),
            JobResult::Failure("no handler for job type: timer.reminder".to_string())
        );
    }

    #[test]
    fn closures_are_command_executors() {
        let executor = |job: &JobRecord, _: &ExecutionContext| {
            if job.handler_type == "ok" {
                JobResult::Success
            } else {
                JobResult::Failure("nope".into())
            }
        };
        assert_eq!(executor.execute(&job("ok"), &ctx()), JobResult::Success);
    }
}
