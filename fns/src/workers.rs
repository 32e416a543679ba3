use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Notify};

use crate::context::Context;
use crate::errors::CodeError;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ceiling on concurrent workers.
    pub max_workers: usize,
    /// Idle workers exit after this long without a task.
    pub max_idle: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: 262_144,
            max_idle: Duration::from_secs(60),
        }
    }
}

/// A unit of work the pool can run. The pool owns no task state beyond the
/// name it logs under; tasks receive a context derived from the
/// dispatcher's.
#[async_trait]
pub trait Task: Send + 'static {
    fn name(&self) -> &str;
    async fn execute(self: Box<Self>, ctx: Context);
}

struct Job {
    ctx: Context,
    task: Box<dyn Task>,
}

impl Job {
    async fn run(self) {
        log::trace!(target: "workers", "Running task '{}'..", self.task.name());
        self.task.execute(self.ctx).await;
    }
}

/// Bounded cooperative worker pool. Workers are created on demand up to the
/// ceiling, reaped after `max_idle`, and acceptance is FIFO: a dispatched
/// task either starts a fresh worker or queues for the idle worker that
/// claimed it.
#[derive(Clone)]
pub struct Workers {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    state: Mutex<State>,
    tx: mpsc::UnboundedSender<Job>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Job>>,
    closed: watch::Sender<bool>,
    /// Notified when a worker frees up; `must_dispatch` retries on it.
    slots: Notify,
    /// Notified when the live count reaches zero.
    drained: Notify,
}

#[derive(Default)]
struct State {
    live: usize,
    idle: usize,
    closed: bool,
}

enum Offer {
    Accepted,
    Saturated(Job),
    Closed(Job),
}

impl Workers {
    pub fn new(config: Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                closed,
                slots: Notify::new(),
                drained: Notify::new(),
            }),
        }
    }

    /// Non-blocking dispatch. Returns `false` when the pool is saturated,
    /// closed, or the context has already expired.
    pub fn dispatch(&self, ctx: &Context, task: Box<dyn Task>) -> bool {
        if ctx.is_expired() {
            return false;
        }
        matches!(
            self.offer(Job {
                ctx: ctx.clone(),
                task
            }),
            Offer::Accepted
        )
    }

    /// Dispatch, waiting for a worker slot until the context deadline.
    pub async fn must_dispatch(&self, ctx: &Context, task: Box<dyn Task>) -> Result<(), CodeError> {
        let mut job = Job {
            ctx: ctx.clone(),
            task,
        };
        loop {
            if ctx.is_expired() {
                return Err(CodeError::timeout("deadline exceeded awaiting a worker"));
            }
            // Arm the wakeup before offering, so a slot freed in between
            // is not missed.
            let slot = self.inner.slots.notified();
            tokio::pin!(slot);
            slot.as_mut().enable();

            job = match self.offer(job) {
                Offer::Accepted => return Ok(()),
                Offer::Closed(_) => return Err(CodeError::unavailable("worker pool is closed")),
                Offer::Saturated(job) => job,
            };
            tokio::select! {
                _ = &mut slot => {}
                _ = ctx.expired() => {
                    return Err(CodeError::timeout("deadline exceeded awaiting a worker"));
                }
            }
        }
    }

    fn offer(&self, job: Job) -> Offer {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Offer::Closed(job);
        }
        if state.idle > 0 {
            state.idle -= 1;
            drop(state);
            // The receiver lives as long as the pool, so this cannot fail.
            self.inner.tx.send(job).ok();
            Offer::Accepted
        } else if state.live < self.inner.config.max_workers {
            state.live += 1;
            drop(state);
            tokio::spawn(worker(self.inner.clone(), job));
            Offer::Accepted
        } else {
            Offer::Saturated(job)
        }
    }

    /// Stop accepting tasks and wait until in-flight ones finish.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
        }
        self.inner.closed.send_replace(true);
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.inner.state.lock().unwrap().live == 0 {
                return;
            }
            drained.await;
        }
    }

    /// Number of live workers, idle included.
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn worker(inner: Arc<Inner>, first: Job) {
    first.run().await;
    'park: loop {
        {
            let mut state = inner.state.lock().unwrap();
            if state.closed {
                retire(&inner, &mut state, false);
                return;
            }
            state.idle += 1;
        }
        inner.slots.notify_waiters();

        let mut closed = inner.closed.subscribe();
        loop {
            let received = {
                let recv = async {
                    let mut rx = inner.rx.lock().await;
                    rx.recv().await
                };
                tokio::select! {
                    job = recv => job,
                    _ = tokio::time::sleep(inner.config.max_idle) => None,
                    _ = closed.wait_for(|c| *c) => None,
                }
            };

            match received {
                Some(job) => {
                    // The dispatcher released our idle slot when it
                    // enqueued the job.
                    job.run().await;
                    continue 'park;
                }
                None => {
                    let still_idle = {
                        let mut state = inner.state.lock().unwrap();
                        if state.idle == 0 {
                            true
                        } else {
                            retire(&inner, &mut state, true);
                            false
                        }
                    };
                    if still_idle {
                        // A task was enqueued for this worker right as it
                        // gave up; keep waiting to pick it up. The slot
                        // stays released, so this does not extend idleness.
                        tokio::task::yield_now().await;
                        continue;
                    }
                    return;
                }
            }
        }
    }
}

fn retire(inner: &Inner, state: &mut State, idle: bool) {
    if idle {
        state.idle -= 1;
    }
    state.live -= 1;
    if state.live == 0 {
        inner.drained.notify_waiters();
    }
    inner.slots.notify_waiters();
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct Count {
        hits: Arc<AtomicUsize>,
        hold: Duration,
    }

    #[async_trait]
    impl Task for Count {
        fn name(&self) -> &str {
            "count"
        }

        async fn execute(self: Box<Self>, _ctx: Context) {
            tokio::time::sleep(self.hold).await;
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn task(hits: &Arc<AtomicUsize>, hold: Duration) -> Box<dyn Task> {
        Box::new(Count {
            hits: hits.clone(),
            hold,
        })
    }

    #[tokio::test]
    async fn test_dispatch_and_close() {
        let pool = Workers::new(Config {
            max_workers: 4,
            max_idle: Duration::from_secs(60),
        });
        let ctx = Context::background();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            assert!(pool.dispatch(&ctx, task(&hits, Duration::from_millis(10))));
        }
        pool.close().await;

        assert_eq!(hits.load(Ordering::SeqCst), 4);
        assert!(pool.is_empty());
        assert!(!pool.dispatch(&ctx, task(&hits, Duration::ZERO)));
    }

    #[tokio::test]
    async fn test_saturation() {
        let pool = Workers::new(Config {
            max_workers: 2,
            max_idle: Duration::from_secs(60),
        });
        let ctx = Context::background();
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(pool.dispatch(&ctx, task(&hits, Duration::from_millis(200))));
        assert!(pool.dispatch(&ctx, task(&hits, Duration::from_millis(200))));
        assert!(!pool.dispatch(&ctx, task(&hits, Duration::ZERO)));

        // `must_dispatch` waits for a slot instead.
        pool.must_dispatch(&ctx, task(&hits, Duration::ZERO))
            .await
            .unwrap();
        pool.close().await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_must_dispatch_deadline() {
        let pool = Workers::new(Config {
            max_workers: 1,
            max_idle: Duration::from_secs(60),
        });
        let ctx = Context::background();
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(pool.dispatch(&ctx, task(&hits, Duration::from_millis(500))));

        let bounded = ctx.with_timeout(Duration::from_millis(20));
        let err = pool
            .must_dispatch(&bounded, task(&hits, Duration::ZERO))
            .await
            .unwrap_err();
        assert_eq!(err.name, "timeout");
    }

    #[tokio::test]
    async fn test_expired_context_rejected() {
        let pool = Workers::new(Config::default());
        let ctx = Context::background().with_timeout(Duration::ZERO);
        let hits = Arc::new(AtomicUsize::new(0));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!pool.dispatch(&ctx, task(&hits, Duration::ZERO)));
    }

    #[tokio::test]
    async fn test_idle_reaping() {
        let pool = Workers::new(Config {
            max_workers: 4,
            max_idle: Duration::from_millis(30),
        });
        let ctx = Context::background();
        let hits = Arc::new(AtomicUsize::new(0));

        assert!(pool.dispatch(&ctx, task(&hits, Duration::ZERO)));
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(pool.is_empty());
    }
}
