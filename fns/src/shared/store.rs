use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::errors::CodeError;

use super::Scope;

/// TTL key/value store with atomic counters. A zero TTL never expires.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, CodeError>;

    /// Set without expiry.
    async fn set(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<(), CodeError>;

    async fn set_with_ttl(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CodeError>;

    /// Atomically add `delta` to the counter at `key`, creating it at zero.
    /// A result below zero removes the key.
    async fn incr(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
        delta: i64,
    ) -> Result<i64, CodeError>;

    /// Reset the expiry of an existing key; zero clears it.
    async fn expire_key(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
        ttl: Duration,
    ) -> Result<(), CodeError>;

    async fn remove(&self, ctx: &Context, scope: Scope, key: &[u8]) -> Result<(), CodeError>;
}
