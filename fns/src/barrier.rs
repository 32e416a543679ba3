use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::argument::Argument;
use crate::context::Context;
use crate::errors::CodeError;
use crate::shared::{Scope, Shared};

pub type BarrierResult = Result<Argument, CodeError>;
pub type BarrierFuture = Pin<Box<dyn Future<Output = BarrierResult> + Send + 'static>>;

/// Collapses duplicate concurrent work by key: at most one execution of
/// `fut` is in flight per key within the barrier's scope, and every caller
/// waiting on that key observes the same result.
#[async_trait]
pub trait Barrier: Send + Sync {
    async fn execute(&self, ctx: &Context, key: &str, fut: BarrierFuture) -> BarrierResult;

    /// Drop the in-flight slot for `key`; late waiters still resolve.
    async fn forget(&self, key: &str);
}

/// In-process single-flight.
#[derive(Default)]
pub struct LocalBarrier {
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

#[derive(Default)]
struct Flight {
    notify: Notify,
    result: OnceLock<BarrierResult>,
}

impl LocalBarrier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Barrier for LocalBarrier {
    async fn execute(&self, ctx: &Context, key: &str, fut: BarrierFuture) -> BarrierResult {
        let (flight, leader) = {
            let mut flights = self.flights.lock().unwrap();
            match flights.get(key) {
                Some(flight) => (flight.clone(), false),
                None => {
                    let flight = Arc::new(Flight::default());
                    flights.insert(key.to_string(), flight.clone());
                    (flight, true)
                }
            }
        };

        if leader {
            let result = fut.await;
            flight.result.set(result.clone()).ok();
            flight.notify.notify_waiters();

            let mut flights = self.flights.lock().unwrap();
            if let Some(current) = flights.get(key) {
                if Arc::ptr_eq(current, &flight) {
                    flights.remove(key);
                }
            }
            result
        } else {
            loop {
                // Arm the wakeup before checking, so a completion landing
                // in between is not missed.
                let notified = flight.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if let Some(result) = flight.result.get() {
                    return result.clone();
                }
                tokio::select! {
                    _ = &mut notified => {}
                    _ = ctx.expired() => {
                        return Err(CodeError::timeout("deadline exceeded awaiting shared result"));
                    }
                }
            }
        }
    }

    async fn forget(&self, key: &str) {
        self.flights.lock().unwrap().remove(key);
    }
}

/// Cluster-wide barrier: in-process callers collapse through a local
/// single-flight, and the surviving leader serialises against other
/// processes with a distributed lock, consulting a short-lived shared
/// result cache to absorb a thundering herd. The cache is an optimisation,
/// never a correctness guarantee.
pub struct ClusterBarrier {
    local: LocalBarrier,
    shared: Shared,
    /// TTL of the shared result entry.
    result_ttl: Duration,
    /// TTL bounding the distributed lock should its holder die.
    lock_ttl: Duration,
}

const KIND_VALUE: u16 = 1;
const KIND_ERROR: u16 = 2;

impl ClusterBarrier {
    pub fn new(shared: Shared, result_ttl: Duration) -> Self {
        Self {
            local: LocalBarrier::new(),
            shared,
            result_ttl,
            lock_ttl: Duration::from_secs(10),
        }
    }

    fn encode(result: &BarrierResult) -> Result<Vec<u8>, CodeError> {
        let (kind, payload) = match result {
            Ok(value) => (KIND_VALUE, value.bytes().to_vec()),
            Err(err) => (KIND_ERROR, serde_json::to_vec(err)?),
        };
        let mut bytes = Vec::with_capacity(2 + payload.len());
        bytes.extend_from_slice(&kind.to_le_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    fn decode(bytes: &[u8]) -> Result<BarrierResult, CodeError> {
        if bytes.len() < 2 {
            return Err(CodeError::internal("barrier result cache is corrupted"));
        }
        let kind = u16::from_le_bytes([bytes[0], bytes[1]]);
        let payload = &bytes[2..];
        match kind {
            KIND_VALUE => Argument::from_raw(payload.to_vec())
                .map(Ok)
                .map_err(|e| CodeError::internal("barrier result cache is corrupted").with_cause(e)),
            KIND_ERROR => serde_json::from_slice::<CodeError>(payload)
                .map(Err)
                .map_err(|e| {
                    CodeError::internal("barrier result cache is corrupted").with_cause(e.into())
                }),
            _ => Err(CodeError::internal("barrier result cache is corrupted")),
        }
    }
}

#[async_trait]
impl Barrier for ClusterBarrier {
    async fn execute(&self, ctx: &Context, key: &str, fut: BarrierFuture) -> BarrierResult {
        let shared = self.shared.clone();
        let result_ttl = self.result_ttl;
        let lock_ttl = self.lock_ttl;
        let lock_key = format!("barrier/{key}");
        let result_key = format!("barrier/{key}/result");
        let inner_ctx = ctx.clone();

        let guarded: BarrierFuture = Box::pin(async move {
            let mut locker = shared
                .lockers()
                .acquire(&inner_ctx, Scope::System, lock_key.as_bytes(), lock_ttl)
                .await?;
            locker.lock(&inner_ctx).await?;

            let outcome = async {
                match shared
                    .store()
                    .get(&inner_ctx, Scope::System, result_key.as_bytes())
                    .await?
                {
                    Some(cached) => Self::decode(&cached)?,
                    None => {
                        let result = fut.await;
                        if let Ok(encoded) = Self::encode(&result) {
                            shared
                                .store()
                                .set_with_ttl(
                                    &inner_ctx,
                                    Scope::System,
                                    result_key.as_bytes(),
                                    encoded,
                                    result_ttl,
                                )
                                .await
                                .ok();
                        }
                        result
                    }
                }
            }
            .await;

            locker.unlock(&inner_ctx).await.ok();
            outcome
        });

        self.local.execute(ctx, key, guarded).await
    }

    async fn forget(&self, key: &str) {
        self.local.forget(key).await;
        let result_key = format!("barrier/{key}/result");
        self.shared
            .store()
            .remove(&Context::background(), Scope::System, result_key.as_bytes())
            .await
            .ok();
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn work(hits: Arc<AtomicUsize>, value: i64) -> BarrierFuture {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            hits.fetch_add(1, Ordering::SeqCst);
            Argument::new(&value)
        })
    }

    #[tokio::test]
    async fn test_concurrent_callers_collapse() {
        let barrier = Arc::new(LocalBarrier::new());
        let ctx = Context::background();
        let hits = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let barrier = barrier.clone();
            let ctx = ctx.clone();
            let hits = hits.clone();
            handles.push(tokio::spawn(async move {
                barrier.execute(&ctx, "sleep/200", work(hits, 7)).await
            }));
        }
        for handle in handles {
            let value = handle.await.unwrap().unwrap();
            assert_eq!(value.decode::<i64>().unwrap(), 7);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sequential_callers_execute_again() {
        let barrier = LocalBarrier::new();
        let ctx = Context::background();
        let hits = Arc::new(AtomicUsize::new(0));

        barrier
            .execute(&ctx, "k", work(hits.clone(), 1))
            .await
            .unwrap();
        barrier
            .execute(&ctx, "k", work(hits.clone(), 2))
            .await
            .unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_waiters_observe_failure() {
        let barrier = Arc::new(LocalBarrier::new());
        let ctx = Context::background();

        let failing: BarrierFuture = Box::pin(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(CodeError::unavailable("backend gone"))
        });
        let leader = {
            let barrier = barrier.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { barrier.execute(&ctx, "fail", failing).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let never: BarrierFuture = Box::pin(async { Argument::new(&0) });
        let waiter = barrier.execute(&ctx, "fail", never).await;

        assert_eq!(leader.await.unwrap().unwrap_err().name, "unavailable");
        assert_eq!(waiter.unwrap_err().name, "unavailable");
    }

    #[tokio::test]
    async fn test_cluster_barrier_result_cache() {
        let shared = Shared::local(1024 * 1024);
        let barrier = ClusterBarrier::new(shared, Duration::from_secs(5));
        let ctx = Context::background();
        let hits = Arc::new(AtomicUsize::new(0));

        let first = barrier
            .execute(&ctx, "pay/42", work(hits.clone(), 9))
            .await
            .unwrap();
        // Within the result TTL the cached value short-circuits execution.
        let second = barrier
            .execute(&ctx, "pay/42", work(hits.clone(), 11))
            .await
            .unwrap();

        assert_eq!(first.decode::<i64>().unwrap(), 9);
        assert_eq!(second.decode::<i64>().unwrap(), 9);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_corrupt_cache_is_an_error() {
        let shared = Shared::local(1024 * 1024);
        let ctx = Context::background();
        shared
            .store()
            .set(&ctx, Scope::System, b"barrier/x/result", vec![0xff])
            .await
            .unwrap();

        let barrier = ClusterBarrier::new(shared, Duration::from_millis(100));
        let err = barrier
            .execute(&ctx, "x", Box::pin(async { Argument::new(&1) }))
            .await
            .unwrap_err();
        assert_eq!(err.name, "internal");
    }

    #[test]
    fn test_result_codec() {
        let ok: BarrierResult = Ok(Argument::from_raw(br#"{"n":1}"#.to_vec()).unwrap());
        let encoded = ClusterBarrier::encode(&ok).unwrap();
        assert_eq!(&encoded[..2], &1u16.to_le_bytes());
        assert_eq!(ClusterBarrier::decode(&encoded).unwrap(), ok);

        let err: BarrierResult = Err(CodeError::locked("busy"));
        let encoded = ClusterBarrier::encode(&err).unwrap();
        assert_eq!(&encoded[..2], &2u16.to_le_bytes());
        assert_eq!(ClusterBarrier::decode(&encoded).unwrap(), err);

        assert!(ClusterBarrier::decode(&[9, 9, 0]).is_err());
        assert!(ClusterBarrier::decode(&[1]).is_err());
    }
}
