pub mod app_id;
pub mod config_cache;
pub mod cookie;
pub mod debounce;
pub mod error;
pub mod models;
pub mod notify;
pub mod provider;
pub mod session;
pub mod wakeup;

pub use app_id::{AppId, app_id_from_host};
pub use config_cache::{ConfigCache, LoadedConfig};
pub use cookie::{CookieCodec, CookieError, derive_cookie_secret};
pub use debounce::KeyedDebouncer;
pub use error::ProxyError;
pub use models::{AppConfig, AuthRule, RuleType};
pub use notify::NotifyManager;
pub use provider::{EngineKind, EngineOptions, Provider};
pub use session::{PendingLogin, Session};
pub use wakeup::WakeupManager;
