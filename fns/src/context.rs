use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::runtime::Runtime;
use crate::services::Request;
use crate::tracer::Tracer;

/// Explicit call context threaded through every suspension point. Carries
/// the process runtime handle, the request being served, its tracer and an
/// optional deadline. Contexts are immutable; `with_*` derives a child and
/// a child deadline never extends the parent's.
#[derive(Clone, Default)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Clone, Default)]
struct Inner {
    deadline: Option<Instant>,
    request: Option<Arc<Request>>,
    tracer: Option<Tracer>,
    runtime: Option<Runtime>,
}

impl Context {
    /// A context with no deadline and nothing attached.
    pub fn background() -> Self {
        Self::default()
    }

    fn derive(&self, mutate: impl FnOnce(&mut Inner)) -> Self {
        let mut inner = (*self.inner).clone();
        mutate(&mut inner);
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        self.derive(|inner| {
            inner.deadline = Some(match inner.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            });
        })
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_request(&self, request: Arc<Request>) -> Self {
        self.derive(|inner| inner.request = Some(request))
    }

    pub fn with_tracer(&self, tracer: Tracer) -> Self {
        self.derive(|inner| inner.tracer = Some(tracer))
    }

    pub fn with_runtime(&self, runtime: Runtime) -> Self {
        self.derive(|inner| inner.runtime = Some(runtime))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(r) if r.is_zero())
    }

    /// Resolves when the deadline fires; pends forever without one.
    pub async fn expired(&self) {
        match self.inner.deadline {
            Some(deadline) => {
                tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
            }
            None => std::future::pending().await,
        }
    }

    pub fn request(&self) -> Option<&Arc<Request>> {
        self.inner.request.as_ref()
    }

    pub fn tracer(&self) -> Option<&Tracer> {
        self.inner.tracer.as_ref()
    }

    pub fn runtime(&self) -> Option<&Runtime> {
        self.inner.runtime.as_ref()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_child_deadline_never_extends_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));

        assert!(child.deadline().unwrap() <= parent.deadline().unwrap() + Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_expiry() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        assert!(!ctx.is_expired());

        ctx.expired().await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }
}
