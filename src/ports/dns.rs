use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

/// DNS lookup failures. `NotFound` is what a sleeping app looks like: its
/// service record disappears until the control plane starts it again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DnsError {
    #[error("no DNS record found for host \"{host}\"")]
    NotFound { host: String },

    #[error("DNS lookup for host \"{host}\" failed: {reason}")]
    Lookup { host: String, reason: String },
}

impl DnsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DnsError::NotFound { .. })
    }
}

/// Resolve defines the port for upstream host name resolution.
#[async_trait]
pub trait Resolve: Send + Sync + 'static {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}
