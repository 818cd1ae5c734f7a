//! Caches one [`AppHandler`] per app and rebuilds it when the config changes.
use std::sync::Arc;

use tokio::sync::Mutex;

use super::app_handler::{AppHandler, AppHandlerDeps};
use crate::core::{AppConfig, AppId, LoadedConfig, ProxyError};

/// Last build for one app; a failed build is kept and replayed until the
/// config changes.
struct Built {
    config: Arc<AppConfig>,
    handler: Result<Arc<AppHandler>, ProxyError>,
}

pub struct AppHandlerManager {
    deps: AppHandlerDeps,
    handlers: scc::HashMap<AppId, Arc<Mutex<Option<Built>>>>,
}

impl AppHandlerManager {
    pub fn new(deps: AppHandlerDeps) -> Self {
        Self {
            deps,
            handlers: scc::HashMap::new(),
        }
    }

    /// Returns the handler for a config load result. Builds are serialized
    /// per app; the hot path only clones an `Arc`.
    pub async fn handler_for(
        &self,
        app_id: &AppId,
        loaded: Result<LoadedConfig, ProxyError>,
    ) -> Result<Arc<AppHandler>, ProxyError> {
        let loaded = loaded?;

        let slot = self
            .handlers
            .entry_async(app_id.clone())
            .await
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .get()
            .clone();
        let mut slot = slot.lock().await;

        if let Some(built) = slot.as_ref()
            && !loaded.modified
            && Arc::ptr_eq(&built.config, &loaded.config)
        {
            return built.handler.clone();
        }

        let handler = match AppHandler::build(app_id, &loaded.config, &self.deps).await {
            Ok(handler) => {
                tracing::info!(app_id = %app_id, "App handler built");
                Ok(Arc::new(handler))
            }
            Err(err) => {
                tracing::error!(
                    app_id = %app_id,
                    exception_id = err.exception_id().unwrap_or_default(),
                    error = %err,
                    "Unable to build app handler"
                );
                Err(err)
            }
        };

        if let Some(Built {
            handler: Ok(previous),
            ..
        }) = slot.take()
        {
            previous.cancel();
        }
        *slot = Some(Built {
            config: loaded.config,
            handler: handler.clone(),
        });
        handler
    }
}
