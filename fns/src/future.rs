use tokio::sync::oneshot;

use crate::argument::Argument;
use crate::context::Context;
use crate::errors::CodeError;

/// Create a one-shot promise/future pair. The promise side is consumed by
/// whichever completion arrives first; the channel never delivers twice.
pub fn future() -> (Promise, Future) {
    let (tx, rx) = oneshot::channel();
    (Promise { tx }, Future { rx })
}

/// Write side of a pending result.
pub struct Promise {
    tx: oneshot::Sender<Result<Argument, CodeError>>,
}

impl Promise {
    pub fn succeed(self, value: Argument) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn fail(self, err: CodeError) {
        let _ = self.tx.send(Err(err));
    }
}

/// Read side of a pending result.
pub struct Future {
    rx: oneshot::Receiver<Result<Argument, CodeError>>,
}

impl Future {
    /// Await the result, honouring the context deadline. A promise dropped
    /// without completion surfaces as an internal error.
    pub async fn get(self, ctx: &Context) -> Result<Argument, CodeError> {
        let recv = async {
            self.rx
                .await
                .unwrap_or_else(|_| Err(CodeError::internal("promise dropped before completion")))
        };
        match ctx.deadline() {
            None => recv.await,
            Some(deadline) => {
                match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), recv).await
                {
                    Ok(result) => result,
                    Err(_) => Err(CodeError::timeout("deadline exceeded awaiting result")),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_succeed_then_get() {
        let (promise, fut) = future();
        promise.succeed(Argument::new(&5).unwrap());

        let value = fut.get(&Context::background()).await.unwrap();
        assert_eq!(value.decode::<i64>().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_fail_then_get() {
        let (promise, fut) = future();
        promise.fail(CodeError::overloaded("pool saturated"));

        let err = fut.get(&Context::background()).await.unwrap_err();
        assert_eq!(err.name, "overloaded");
    }

    #[tokio::test]
    async fn test_dropped_promise() {
        let (promise, fut) = future();
        drop(promise);

        let err = fut.get(&Context::background()).await.unwrap_err();
        assert_eq!(err.name, "internal");
    }

    #[tokio::test]
    async fn test_deadline_elapses() {
        let (_promise, fut) = future();
        let ctx = Context::background().with_timeout(Duration::from_millis(50));

        let err = fut.get(&ctx).await.unwrap_err();
        assert_eq!(err.name, "timeout");
    }
}
