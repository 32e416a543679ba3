use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::errors::CodeError;

use super::Scope;

/// Opportunistic TTL cache. `set` may reject the entry under pressure and
/// returns whether it was admitted; nothing here is durable.
#[async_trait]
pub trait Caches: Send + Sync {
    async fn get(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, CodeError>;

    async fn exist(&self, ctx: &Context, scope: Scope, key: &[u8]) -> Result<bool, CodeError>;

    async fn set(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, CodeError>;

    async fn remove(&self, ctx: &Context, scope: Scope, key: &[u8]) -> Result<(), CodeError>;
}
