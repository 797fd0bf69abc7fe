//! The Echo Service and the call boundary Workers drive.

use crate::error::CallError;
use bytes::Bytes;
use std::future::Future;

/// The service under load: `Get(key)` answers with `key`, byte for byte.
///
/// Stateless, so one instance is shared by every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoService;

impl EchoService {
    pub fn get(&self, key: Bytes) -> Bytes {
        key
    }
}

/// Client side of the `Get(key) -> value` call.
///
/// One handle is shared by all Workers, so calls must be issuable
/// concurrently through `&self`.
pub trait EchoClient: Send + Sync + 'static {
    fn get(&self, key: Bytes) -> impl Future<Output = Result<Bytes, CallError>> + Send;
}

/// In-process calls, for runs without a network hop.
impl EchoClient for EchoService {
    async fn get(&self, key: Bytes) -> Result<Bytes, CallError> {
        // Keep the call a real suspension point
        tokio::task::yield_now().await;
        Ok(EchoService::get(self, key))
    }
}
