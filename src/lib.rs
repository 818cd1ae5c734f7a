//! Apps proxy - authentication gateway and reverse proxy for data apps.
//!
//! Every data app lives on its own subdomain of the public domain. For each
//! request the proxy resolves the app from the host, loads the app's
//! authorization config from the control plane (cached, revalidated with
//! ETags, with a stale fallback when the control plane is down), matches the
//! path against the app's rules, authenticates the user against one of the
//! app's identity providers and forwards the request (HTTP or WebSocket) to
//! the app's upstream. Traffic is reported back to the control plane, and an
//! app without a DNS record is asked to wake up.
//!
//! # Architecture
//! The crate separates **ports** (traits at I/O seams) from **adapters**
//! (implementations) while keeping the in-memory logic inside `core`:
//! - [`core`]: app IDs, the config model, providers, config cache, notify and
//!   wakeup debouncing, signed cookies and the error taxonomy.
//! - [`ports`]: control plane, DNS and clock traits.
//! - [`adapters`]: reqwest control-plane client, hickory DNS, upstream proxy,
//!   identity flows, auth handlers, app handlers and the axum router.
//!
//! # Concurrency
//! Per-app state lives in `scc::HashMap`s of per-key `tokio::sync::Mutex`es:
//! the map is only touched to find or insert an entry, and only the entry
//! lock is held across I/O. Requests for different apps never wait on each
//! other.
pub mod adapters;
pub mod config;
pub mod core;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub use crate::{
    adapters::{AppHandlerManager, ProxyRouter, UpstreamManager},
    core::{AppId, ConfigCache, ProxyError},
    utils::GracefulShutdown,
};
