//! Upstream name resolution.
//!
//! [`HickoryResolver`] implements the [`Resolve`] port against the system DNS
//! configuration. [`ResolverService`] adapts any `Resolve` into the
//! `tower::Service<Name>` shape hyper's `HttpConnector` expects, so lookup
//! failures keep their typed [`DnsError`] inside the client error chain.
use std::{
    collections::HashMap,
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::{Arc, RwLock},
    task::{Context, Poll},
};

use async_trait::async_trait;
use eyre::{Context as _, Result};
use hickory_resolver::TokioResolver;
use hyper_util::client::legacy::connect::dns::Name;
use tower::Service;

use crate::ports::{DnsError, Resolve};

pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    /// Builds a resolver from the host's `/etc/resolv.conf` (or platform equivalent).
    pub fn from_system_conf() -> Result<Self> {
        let resolver = TokioResolver::builder_tokio()
            .context("Failed to create DNS resolver")?
            .build();
        Ok(Self { resolver })
    }
}

#[async_trait]
impl Resolve for HickoryResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => {
                let addrs: Vec<IpAddr> = lookup.iter().collect();
                if addrs.is_empty() {
                    Err(DnsError::NotFound {
                        host: host.to_string(),
                    })
                } else {
                    Ok(addrs)
                }
            }
            Err(err) if err.is_no_records_found() || err.is_nx_domain() => {
                Err(DnsError::NotFound {
                    host: host.to_string(),
                })
            }
            Err(err) => Err(DnsError::Lookup {
                host: host.to_string(),
                reason: err.to_string(),
            }),
        }
    }
}

/// Fixed host table. Hosts without an entry are reported as not found.
#[derive(Default)]
pub struct StaticResolver {
    hosts: RwLock<HashMap<String, Vec<IpAddr>>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, host: &str, ip: IpAddr) {
        if let Ok(mut hosts) = self.hosts.write() {
            hosts.insert(host.to_ascii_lowercase(), vec![ip]);
        }
    }

    pub fn remove(&self, host: &str) {
        if let Ok(mut hosts) = self.hosts.write() {
            hosts.remove(&host.to_ascii_lowercase());
        }
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        self.hosts
            .read()
            .ok()
            .and_then(|hosts| hosts.get(&host.to_ascii_lowercase()).cloned())
            .ok_or_else(|| DnsError::NotFound {
                host: host.to_string(),
            })
    }
}

/// Bridges a [`Resolve`] implementation into hyper's connector.
#[derive(Clone)]
pub struct ResolverService {
    resolver: Arc<dyn Resolve>,
}

impl ResolverService {
    pub fn new(resolver: Arc<dyn Resolve>) -> Self {
        Self { resolver }
    }
}

impl Service<Name> for ResolverService {
    type Response = std::vec::IntoIter<SocketAddr>;
    type Error = DnsError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, name: Name) -> Self::Future {
        let resolver = self.resolver.clone();
        Box::pin(async move {
            let addrs = resolver.lookup(name.as_str()).await?;
            // HttpConnector fills in the port.
            Ok(addrs
                .into_iter()
                .map(|ip| SocketAddr::new(ip, 0))
                .collect::<Vec<_>>()
                .into_iter())
        })
    }
}

/// Finds a [`DnsError`] anywhere in an error's source chain.
pub fn find_dns_error<'a>(err: &'a (dyn std::error::Error + 'static)) -> Option<&'a DnsError> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(dns) = err.downcast_ref::<DnsError>() {
            return Some(dns);
        }
        current = err.source();
    }
    None
}
