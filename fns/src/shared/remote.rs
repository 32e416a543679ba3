use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::errors::CodeError;
use crate::header;
use crate::signature::Signer;

use super::{Caches, Locker, Lockers, Scope, Store};

/// One shared operation on the wire, POSTed to a peer's `/cluster/shared`.
/// Keys and values travel base64-encoded; locks are lease-based so the
/// serving peer can reap a dead holder at the TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedCommand {
    pub capability: String,
    pub op: String,
    pub scope: Scope,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_ms: Option<u64>,
}

impl SharedCommand {
    pub fn new(capability: &str, op: &str, scope: Scope, key: &[u8]) -> Self {
        Self {
            capability: capability.to_string(),
            op: op.to_string(),
            scope,
            key: BASE64_STANDARD.encode(key),
            value: None,
            ttl_ms: None,
            delta: None,
            lease: None,
            wait_ms: None,
        }
    }

    pub fn key_bytes(&self) -> Result<Vec<u8>, CodeError> {
        BASE64_STANDARD
            .decode(&self.key)
            .map_err(|e| CodeError::bad_request(format!("shared key does not decode: {e}")))
    }

    pub fn value_bytes(&self) -> Result<Option<Vec<u8>>, CodeError> {
        self.value
            .as_ref()
            .map(|value| {
                BASE64_STANDARD
                    .decode(value)
                    .map_err(|e| CodeError::bad_request(format!("shared value does not decode: {e}")))
            })
            .transpose()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<String>,
}

impl SharedReply {
    pub fn with_value(bytes: &[u8]) -> Self {
        Self {
            value: Some(BASE64_STANDARD.encode(bytes)),
            ..Self::default()
        }
    }

    fn value_bytes(&self) -> Result<Option<Vec<u8>>, CodeError> {
        self.value
            .as_ref()
            .map(|value| {
                BASE64_STANDARD
                    .decode(value)
                    .map_err(|_| CodeError::internal("shared reply value does not decode"))
            })
            .transpose()
    }
}

/// Client side of the shared tunnel: every call becomes a signed HTTP
/// request to the configured peer.
#[derive(Clone)]
pub struct RemoteShared {
    inner: Arc<Tunnel>,
}

struct Tunnel {
    client: reqwest::Client,
    address: String,
    signer: Signer,
    device_id: String,
}

impl RemoteShared {
    pub fn new(address: impl Into<String>, signer: Signer, device_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Tunnel {
                client: reqwest::Client::new(),
                address: address.into(),
                signer,
                device_id: device_id.into(),
            }),
        }
    }

    async fn call(&self, ctx: &Context, command: &SharedCommand) -> Result<SharedReply, CodeError> {
        let tunnel = &self.inner;
        let body = serde_json::to_vec(command)?;
        let signature = tunnel.signer.sign(&body);
        let url = format!("http://{}/cluster/shared", tunnel.address);

        let mut request = tunnel
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header(header::DEVICE_ID, &tunnel.device_id)
            .header(header::REQUEST_INTERNAL, "1")
            .header(header::REQUEST_SIGNATURE, signature)
            .body(body);
        if let Some(remaining) = ctx.remaining() {
            request = request.timeout(remaining.max(Duration::from_millis(1)));
        }

        let response = request.send().await.map_err(|e| {
            CodeError::unavailable(format!("shared peer '{}' unreachable: {e}", tunnel.address))
        })?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| {
            CodeError::unavailable(format!("shared peer '{}' failed mid-reply: {e}", tunnel.address))
        })?;

        if !status.is_success() {
            return Err(serde_json::from_slice::<CodeError>(&bytes).unwrap_or_else(|_| {
                CodeError::internal(format!("shared peer replied with status {status}"))
            }));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl Store for RemoteShared {
    async fn get(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, CodeError> {
        let reply = self
            .call(ctx, &SharedCommand::new("store", "get", scope, key))
            .await?;
        reply.value_bytes()
    }

    async fn set(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
        value: Vec<u8>,
    ) -> Result<(), CodeError> {
        let mut command = SharedCommand::new("store", "set", scope, key);
        command.value = Some(BASE64_STANDARD.encode(value));
        self.call(ctx, &command).await?;
        Ok(())
    }

    async fn set_with_ttl(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CodeError> {
        let mut command = SharedCommand::new("store", "set", scope, key);
        command.value = Some(BASE64_STANDARD.encode(value));
        command.ttl_ms = Some(ttl.as_millis() as u64);
        self.call(ctx, &command).await?;
        Ok(())
    }

    async fn incr(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
        delta: i64,
    ) -> Result<i64, CodeError> {
        let mut command = SharedCommand::new("store", "incr", scope, key);
        command.delta = Some(delta);
        let reply = self.call(ctx, &command).await?;
        reply
            .counter
            .ok_or_else(|| CodeError::internal("shared peer reply misses the counter"))
    }

    async fn expire_key(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
        ttl: Duration,
    ) -> Result<(), CodeError> {
        let mut command = SharedCommand::new("store", "expire", scope, key);
        command.ttl_ms = Some(ttl.as_millis() as u64);
        self.call(ctx, &command).await?;
        Ok(())
    }

    async fn remove(&self, ctx: &Context, scope: Scope, key: &[u8]) -> Result<(), CodeError> {
        self.call(ctx, &SharedCommand::new("store", "remove", scope, key))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Lockers for RemoteShared {
    async fn acquire(
        &self,
        _ctx: &Context,
        scope: Scope,
        key: &[u8],
        ttl: Duration,
    ) -> Result<Box<dyn Locker>, CodeError> {
        Ok(Box::new(RemoteLocker {
            tunnel: self.clone(),
            scope,
            key: key.to_vec(),
            ttl,
            lease: None,
        }))
    }
}

struct RemoteLocker {
    tunnel: RemoteShared,
    scope: Scope,
    key: Vec<u8>,
    ttl: Duration,
    lease: Option<String>,
}

#[async_trait]
impl Locker for RemoteLocker {
    async fn lock(&mut self, ctx: &Context) -> Result<(), CodeError> {
        if self.lease.is_some() {
            return Ok(());
        }
        let mut command = SharedCommand::new("lockers", "lock", self.scope, &self.key);
        command.ttl_ms = Some(self.ttl.as_millis() as u64);
        command.wait_ms = ctx.remaining().map(|r| r.as_millis() as u64);
        let reply = self.tunnel.call(ctx, &command).await?;
        match reply.lease {
            Some(lease) => {
                self.lease = Some(lease);
                Ok(())
            }
            None => Err(CodeError::internal("shared peer reply misses the lease")),
        }
    }

    async fn unlock(&mut self, ctx: &Context) -> Result<(), CodeError> {
        let Some(lease) = self.lease.take() else {
            return Ok(());
        };
        let mut command = SharedCommand::new("lockers", "unlock", self.scope, &self.key);
        command.lease = Some(lease);
        self.tunnel.call(ctx, &command).await?;
        Ok(())
    }
}

#[async_trait]
impl Caches for RemoteShared {
    async fn get(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, CodeError> {
        let reply = self
            .call(ctx, &SharedCommand::new("caches", "get", scope, key))
            .await?;
        reply.value_bytes()
    }

    async fn exist(&self, ctx: &Context, scope: Scope, key: &[u8]) -> Result<bool, CodeError> {
        let reply = self
            .call(ctx, &SharedCommand::new("caches", "exist", scope, key))
            .await?;
        Ok(reply.ok.unwrap_or(false))
    }

    async fn set(
        &self,
        ctx: &Context,
        scope: Scope,
        key: &[u8],
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, CodeError> {
        let mut command = SharedCommand::new("caches", "set", scope, key);
        command.value = Some(BASE64_STANDARD.encode(value));
        command.ttl_ms = Some(ttl.as_millis() as u64);
        let reply = self.call(ctx, &command).await?;
        Ok(reply.ok.unwrap_or(false))
    }

    async fn remove(&self, ctx: &Context, scope: Scope, key: &[u8]) -> Result<(), CodeError> {
        self.call(ctx, &SharedCommand::new("caches", "remove", scope, key))
            .await?;
        Ok(())
    }
}
