//! Header names of the wire contract. Shared by the gateway, the peer
//! endpoints and the registry so the spelling lives in one place.

pub const ID: &str = "X-Fns-Id";
pub const NAME: &str = "X-Fns-Name";
pub const VERSION: &str = "X-Fns-Version";
pub const REQUEST_ID: &str = "X-Fns-Request-Id";
pub const REQUEST_SIGNATURE: &str = "X-Fns-Request-Signature";
pub const REQUEST_INTERNAL: &str = "X-Fns-Request-Internal";
pub const REQUEST_TIMEOUT: &str = "X-Fns-Request-Timeout";
pub const REQUEST_VERSION: &str = "X-Fns-Request-Version";
pub const HANDLE_LATENCY: &str = "X-Fns-Handle-Latency";
pub const DEVICE_ID: &str = "X-Fns-Device-Id";
pub const DEVICE_IP: &str = "X-Fns-Device-Ip";
pub const PROXY_NODE: &str = "X-Fns-Proxy-Node";
pub const FORWARDED_FOR: &str = "X-Forwarded-For";
pub const CLEAR_SITE_DATA: &str = "Clear-Site-Data";
