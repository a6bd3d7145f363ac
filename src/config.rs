//! Runtime engine configuration.
//!
//! Capacities (calls, channels, methods) are const generics on the
//! respective tables. Everything here is a runtime tunable that can be
//! loaded from persistent storage at boot.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rpc::packet::MAX_PAYLOAD_LEN;

/// Upper bound on the postcard-encoded size of [`RpcConfig`].
pub const CONFIG_MAX_ENCODED_LEN: usize = 16;

/// Engine configuration shared by clients and servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Largest payload accepted on decode (bytes).
    pub max_payload_len: u32,
    /// Server replies to `Cancel` with a best-effort `ServerError(Cancelled)`.
    pub acknowledge_cancel: bool,
    /// Answer stream packets for calls that are no longer active with an
    /// error packet so the peer stops sending.
    pub report_unknown_calls: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            max_payload_len: MAX_PAYLOAD_LEN as u32,
            acknowledge_cancel: false,
            report_unknown_calls: true,
        }
    }
}

impl RpcConfig {
    /// Reject values the fixed packet buffer cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.max_payload_len == 0 || self.max_payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len as usize
    }

    /// Serialize into `buf` for persistent storage. Returns the used prefix.
    pub fn to_bytes<'b>(&self, buf: &'b mut [u8]) -> Result<&'b mut [u8]> {
        postcard::to_slice(self, buf).map_err(|_| Error::ResourceExhausted)
    }

    /// Load a persisted config, validating it before use.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config: Self = postcard::from_bytes(bytes).map_err(|_| Error::InvalidArgument)?;
        config.validate()?;
        Ok(config)
    }
}
