use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// The result of running a job handler.
///
/// Handlers report failure as a value rather than by raising; the dispatcher
/// branches on the tag and applies the same retry policy either way. Panics
/// inside a handler are caught and converted into a [`JobOutcome::Failure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The job finished. Optional `data` is merged into the job's payload
    /// for later inspection.
    Success {
        /// Handler-produced result data, if any.
        data: Option<Value>,
    },
    /// The job failed; the message is recorded as the row's `last_error`.
    Failure {
        /// Human-readable failure message.
        error: String,
    },
}

impl JobOutcome {
    /// A successful outcome with no result data.
    pub fn success() -> Self {
        Self::Success { data: None }
    }

    /// A successful outcome whose `data` is merged into the job payload.
    pub fn success_with(data: Value) -> Self {
        Self::Success { data: Some(data) }
    }

    /// A failed outcome with the given error message.
    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            error: error.into(),
        }
    }
}

/// A registered job handler: context plus payload in, [`JobOutcome`] out.
pub type HandlerFn<Context> =
    Arc<dyn Fn(Context, Value) -> BoxFuture<'static, JobOutcome> + Send + Sync>;

/// Box an async closure into a [`HandlerFn`], e.g. for
/// [`HandlerRegistry::register_many`].
pub fn handler<Context, F, Fut>(f: F) -> HandlerFn<Context>
where
    F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobOutcome> + Send + 'static,
{
    Arc::new(move |ctx, payload| f(ctx, payload).boxed())
}

/// Maps job type names to their handlers.
///
/// The registry holds no business logic; concrete handlers are injected by
/// the process entry point. Registering a type twice replaces the previous
/// handler (last registration wins).
pub struct HandlerRegistry<Context> {
    handlers: HashMap<String, HandlerFn<Context>>,
}

impl<Context> Clone for HandlerRegistry<Context> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<Context> Default for HandlerRegistry<Context> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<Context> std::fmt::Debug for HandlerRegistry<Context> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<Context: Clone + Send + Sync + 'static> HandlerRegistry<Context> {
    /// Register a handler for `job_type`, replacing any existing one.
    pub fn register<F, Fut>(&mut self, job_type: impl Into<String>, handler: F)
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = JobOutcome> + Send + 'static,
    {
        let handler: HandlerFn<Context> =
            Arc::new(move |ctx, payload| handler(ctx, payload).boxed());
        self.handlers.insert(job_type.into(), handler);
    }

    /// Bulk registration convenience; equivalent to calling
    /// [`register`](Self::register) for each entry.
    pub fn register_many(
        &mut self,
        handlers: impl IntoIterator<Item = (String, HandlerFn<Context>)>,
    ) {
        self.handlers.extend(handlers);
    }

    /// Look up the handler for a job type.
    pub fn get(&self, job_type: &str) -> Option<&HandlerFn<Context>> {
        self.handlers.get(job_type)
    }

    /// The job types that currently have a handler registered.
    pub fn job_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn last_registration_wins() {
        let mut registry = HandlerRegistry::<()>::default();
        registry.register("job", |_, _| async { JobOutcome::failure("first") });
        registry.register("job", |_, _| async { JobOutcome::success() });

        let handler = registry.get("job").cloned();
        let outcome = handler.map(|h| h((), Value::Null));
        match outcome {
            Some(fut) => assert_eq!(fut.await, JobOutcome::success()),
            None => panic!("handler missing"),
        }
    }

    #[tokio::test]
    async fn register_many_adds_all_entries() {
        let mut registry = HandlerRegistry::<()>::default();
        registry.register_many([
            ("a".to_owned(), handler(|_, _| async { JobOutcome::success() })),
            ("b".to_owned(), handler(|_, _| async { JobOutcome::failure("nope") })),
        ]);

        let mut types = registry.job_types();
        types.sort();
        assert_eq!(types, ["a", "b"]);
    }

    #[test]
    fn unknown_type_is_absent() {
        let registry = HandlerRegistry::<()>::default();
        assert!(registry.get("nope").is_none());
        assert!(registry.job_types().is_empty());
    }
}
