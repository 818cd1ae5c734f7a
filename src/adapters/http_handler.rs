use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
};

use super::{
    app_manager::AppHandlerManager,
    auth::request_host,
    middleware::{request_id_middleware, request_timing_middleware},
};
use crate::core::{ConfigCache, ProxyError, app_id_from_host};

pub const HEALTH_CHECK_PATH: &str = "/health-check";

/// Entry point of every inbound request: resolves the app from the host and
/// hands the request to that app's handler.
pub struct ProxyRouter {
    public_domain: String,
    configs: Arc<ConfigCache>,
    handlers: Arc<AppHandlerManager>,
}

impl ProxyRouter {
    pub fn new(
        public_domain: impl Into<String>,
        configs: Arc<ConfigCache>,
        handlers: Arc<AppHandlerManager>,
    ) -> Self {
        Self {
            public_domain: public_domain.into(),
            configs,
            handlers,
        }
    }

    /// Axum router with request ID and timing middleware around
    /// [`ProxyRouter::handle_request`].
    pub fn into_router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(|State(router): State<Arc<ProxyRouter>>, req: Request| async move {
                router.handle_request(req).await
            })
            .with_state(self)
            .layer(middleware::from_fn(request_timing_middleware))
            .layer(middleware::from_fn(request_id_middleware))
    }

    pub async fn handle_request(&self, req: Request<Body>) -> Response<Body> {
        let host = request_host(&req);
        let Some(app_id) = app_id_from_host(&host, &self.public_domain) else {
            if req.uri().path() == HEALTH_CHECK_PATH {
                return health_check();
            }
            tracing::debug!(host = %host, "No application ID in host");
            return ProxyError::MissingAppId { host }.into_response();
        };

        let loaded = self.configs.get_config(&app_id).await;
        match self.handlers.handler_for(&app_id, loaded).await {
            Ok(handler) => handler.serve(req).await,
            Err(err) => {
                tracing::debug!(app_id = %app_id, error = %err, "App handler unavailable");
                err.into_response()
            }
        }
    }
}

fn health_check() -> Response<Body> {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "OK",
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use super::*;
    use crate::{
        adapters::{
            app_handler::AppHandlerDeps,
            auth::{AuthHandlerSettings, DefaultFlowFactory, IdentityHeaders},
            dns::StaticResolver,
            upstream::{UpstreamManager, UpstreamSettings},
        },
        core::{NotifyManager, WakeupManager},
        ports::{ControlPlaneError, ManualClock, testing::ScriptedControlPlane},
    };

    fn router(control_plane: Arc<ScriptedControlPlane>) -> Router {
        let clock = Arc::new(ManualClock::default());
        let notify = Arc::new(NotifyManager::new(
            control_plane.clone(),
            clock.clone(),
            Duration::from_secs(30),
        ));
        let wakeup = Arc::new(WakeupManager::new(
            control_plane.clone(),
            clock.clone(),
            Duration::from_secs(1),
        ));
        let upstreams = UpstreamManager::new(
            Arc::new(StaticResolver::new()),
            notify,
            wakeup,
            UpstreamSettings::default(),
        )
        .unwrap();
        let handlers = AppHandlerManager::new(AppHandlerDeps {
            flows: Arc::new(DefaultFlowFactory::new(Duration::from_secs(5)).unwrap()),
            upstreams: Arc::new(upstreams),
            clock: clock.clone(),
            auth: AuthHandlerSettings {
                cookie_secret_salt: "salt".into(),
                session_ttl: Duration::from_secs(3600),
                headers: IdentityHeaders::new("X-Kbc-").unwrap(),
            },
        });
        let configs = Arc::new(ConfigCache::new(control_plane, clock));
        Arc::new(ProxyRouter::new("hub.local", configs, Arc::new(handlers))).into_router()
    }

    fn request(host: &str, path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header(header::HOST, host)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check_without_app() {
        let response = router(Arc::default())
            .oneshot(request("hub.local", HEALTH_CHECK_PATH))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_missing_app_id() {
        let response = router(Arc::default())
            .oneshot(request("a.b.hub.local", "/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_check_is_app_traffic_on_app_host() {
        let control_plane = Arc::new(ScriptedControlPlane::default());
        control_plane.push_fetch(Err(ControlPlaneError::NotFound {
            app_id: crate::core::AppId::new("123"),
        }));
        let response = router(control_plane.clone())
            .oneshot(request("app-123.hub.local", HEALTH_CHECK_PATH))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(control_plane.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_control_plane_failure_is_unavailable() {
        let control_plane = Arc::new(ScriptedControlPlane::default());
        control_plane.push_fetch(Err(ControlPlaneError::Transport("refused".into())));
        let response = router(control_plane)
            .oneshot(request("app-123.hub.local", "/"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(String::from_utf8_lossy(&body).contains("exception-"));
    }
}
