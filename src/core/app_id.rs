//! Application identifiers and host → app resolution.
use std::{fmt, sync::Arc};

/// Opaque identifier of a data app. Cheap to clone; used as cache and
/// debounce key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(Arc<str>);

impl AppId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        AppId::new(value)
    }
}

impl From<String> for AppId {
    fn from(value: String) -> Self {
        AppId::new(value)
    }
}

/// Resolve the app ID from a request host.
///
/// The host must be exactly one label below `public_domain`. The label is
/// either the bare ID (`123`) or `<name>-<id>` (`myapp-123`); the part after
/// the last `-` wins. Ports are ignored and matching is case-insensitive.
pub fn app_id_from_host(host: &str, public_domain: &str) -> Option<AppId> {
    let host = strip_port(host).to_ascii_lowercase();
    let domain = public_domain.trim_end_matches('.').to_ascii_lowercase();

    let subdomain = host.strip_suffix(&domain)?.strip_suffix('.')?;
    if subdomain.is_empty() || subdomain.contains('.') {
        return None;
    }

    let id = match subdomain.rsplit_once('-') {
        Some((_, id)) => id,
        None => subdomain,
    };
    if id.is_empty() {
        return None;
    }

    Some(AppId::new(id))
}

/// Drop an optional `:port` suffix, leaving bracketed IPv6 literals intact.
pub fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
