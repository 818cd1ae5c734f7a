pub mod app_handler;
pub mod app_manager;
pub mod auth;
pub mod control_plane;
pub mod dns;
pub mod http_handler;
pub mod middleware;
pub mod pages;
pub mod upstream;

pub use app_handler::{AppHandler, AppHandlerDeps};
pub use app_manager::AppHandlerManager;
pub use control_plane::HttpControlPlane;
pub use dns::{HickoryResolver, StaticResolver};
pub use http_handler::ProxyRouter;
pub use middleware::*;
pub use upstream::{UpstreamManager, UpstreamSettings};
