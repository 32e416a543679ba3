use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::errors::CodeError;

use super::Scope;

/// Distributed mutex registry. `ttl` bounds how long a lock outlives a
/// holder that dies without unlocking.
#[async_trait]
pub trait Lockers: Send + Sync {
    async fn acquire(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
        ttl: Duration,
    ) -> Result<Box<dyn Locker>, CodeError>;
}

/// One acquired slot of a [`Lockers`] registry. `lock` respects the
/// context deadline; `unlock` releases the slot.
#[async_trait]
pub trait Locker: Send {
    async fn lock(&mut self, ctx: &Context) -> Result<(), CodeError>;
    async fn unlock(&mut self, ctx: &Context) -> Result<(), CodeError>;
}
