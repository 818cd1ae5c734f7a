//! Shared harness: a fake control plane, a fake identity provider, a real
//! upstream and the full proxy router wired together.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use appsproxy::{
    adapters::{
        AppHandlerDeps, AppHandlerManager, HttpControlPlane, ProxyRouter, StaticResolver,
        UpstreamManager, UpstreamSettings,
        auth::{
            AuthError, AuthHandlerSettings, CallbackContext, FlowFactory, Identity,
            IdentityFlow, IdentityHeaders, LoginAction, LoginStart, flow::check_state,
        },
    },
    core::{ConfigCache, EngineOptions, NotifyManager, PendingLogin, WakeupManager},
    ports::{Clock, ControlPlane, SystemClock},
};
use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State, WebSocketUpgrade, ws::Message},
    http::{HeaderMap, Request, Response, StatusCode, header},
    response::IntoResponse,
    routing::{any, get},
};
use axum_extra::extract::cookie::Cookie;
use http_body_util::BodyExt;
use tokio::net::TcpListener;

pub const PUBLIC_DOMAIN: &str = "hub.local";
pub const IDP_AUTHORIZE: &str = "https://idp.test/authorize";

/// Fake OAuth-style provider: redirects to [`IDP_AUTHORIZE`] and accepts any
/// `code`; the code is the user name and its only role.
pub struct FakeFlow {
    provider_id: String,
}

#[async_trait]
impl IdentityFlow for FakeFlow {
    async fn begin(&self, redirect_uri: &str, redirect_to: &str) -> Result<LoginStart, AuthError> {
        let state = format!("{}-{}", self.provider_id, uuid::Uuid::new_v4().simple());
        let location = format!(
            "{IDP_AUTHORIZE}?provider={}&state={state}&redirect_uri={}",
            self.provider_id,
            urlencoding::encode(redirect_uri)
        );
        Ok(LoginStart {
            action: LoginAction::Redirect(location),
            pending: PendingLogin {
                state,
                nonce: None,
                pkce_verifier: None,
                redirect_to: redirect_to.to_string(),
            },
        })
    }

    async fn complete(&self, req: Request<Body>, ctx: CallbackContext) -> Result<Identity, AuthError> {
        let query: HashMap<String, String> = url::form_urlencoded::parse(
            req.uri().query().unwrap_or_default().as_bytes(),
        )
        .into_owned()
        .collect();
        check_state(query.get("state").map(String::as_str), &ctx.pending)?;
        let code = query
            .get("code")
            .ok_or_else(|| AuthError::BadRequest("missing code".into()))?;
        Ok(Identity {
            user: code.clone(),
            email: Some(format!("{code}@example.com")),
            roles: vec![code.clone()],
            access_token: None,
        })
    }
}

pub struct FakeFlowFactory;

#[async_trait]
impl FlowFactory for FakeFlowFactory {
    async fn create(&self, options: &EngineOptions) -> Result<Arc<dyn IdentityFlow>, AuthError> {
        Ok(Arc::new(FakeFlow {
            provider_id: options.provider_id.clone(),
        }))
    }
}

/// In-memory control plane served over HTTP.
#[derive(Clone, Default)]
pub struct FakeControlPlane {
    configs: Arc<Mutex<HashMap<String, serde_json::Value>>>,
    patches: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
}

impl FakeControlPlane {
    pub fn put_app(&self, app_id: &str, config: serde_json::Value) {
        self.configs
            .lock()
            .unwrap()
            .insert(app_id.to_string(), config);
    }

    pub fn notify_count(&self, app_id: &str) -> usize {
        self.count(app_id, "lastRequestTimestamp")
    }

    pub fn wakeup_count(&self, app_id: &str) -> usize {
        self.count(app_id, "desiredState")
    }

    fn count(&self, app_id: &str, field: &str) -> usize {
        self.patches
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, body)| id == app_id && body.get(field).is_some())
            .count()
    }

    async fn start(&self) -> SocketAddr {
        async fn get_config(
            State(cp): State<FakeControlPlane>,
            Path(app_id): Path<String>,
        ) -> Response<Body> {
            match cp.configs.lock().unwrap().get(&app_id) {
                Some(config) => (
                    [
                        (header::ETAG, format!("\"{app_id}-v1\"")),
                        (header::CACHE_CONTROL, "max-age=30".to_string()),
                    ],
                    Json(config.clone()),
                )
                    .into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }

        async fn patch_app(
            State(cp): State<FakeControlPlane>,
            Path(app_id): Path<String>,
            Json(body): Json<serde_json::Value>,
        ) -> StatusCode {
            cp.patches.lock().unwrap().push((app_id, body));
            StatusCode::OK
        }

        let app = Router::new()
            .route("/apps/{app_id}/proxy-config", get(get_config))
            .route("/apps/{app_id}", axum::routing::patch(patch_app))
            .with_state(self.clone());
        serve(app).await
    }
}

/// Upstream app: `/` greets, `/whoami` echoes identity headers, `/ws` echoes
/// WebSocket messages.
async fn start_upstream() -> SocketAddr {
    async fn whoami(headers: HeaderMap) -> Json<serde_json::Value> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Json(serde_json::json!({
            "user": get("x-kbc-user"),
            "email": get("x-kbc-user-email"),
            "roles": get("x-kbc-user-roles"),
            "cookie": get("cookie"),
        }))
    }

    async fn echo(ws: WebSocketUpgrade) -> Response<Body> {
        ws.on_upgrade(|mut socket| async move {
            while let Some(Ok(message)) = socket.recv().await {
                if let Message::Text(text) = message {
                    if socket
                        .send(Message::Text(format!("echo: {}", text.as_str()).into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        })
    }

    let app = Router::new()
        .route("/ws", get(echo))
        .route("/whoami", get(whoami))
        .route("/{*path}", any(|| async { "Hello from upstream" }))
        .route("/", any(|| async { "Hello from upstream" }));
    serve(app).await
}

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

pub struct Harness {
    pub router: Router,
    pub control_plane: FakeControlPlane,
    pub resolver: Arc<StaticResolver>,
    pub upstreams: Arc<UpstreamManager>,
    pub upstream_port: u16,
}

impl Harness {
    pub async fn start() -> Self {
        let control_plane = FakeControlPlane::default();
        let cp_addr = control_plane.start().await;
        let upstream_port = start_upstream().await.port();

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let api: Arc<dyn ControlPlane> = Arc::new(
            HttpControlPlane::new(&format!("http://{cp_addr}"), "token", Duration::from_secs(5))
                .unwrap(),
        );
        let resolver = Arc::new(StaticResolver::new());
        let notify = Arc::new(NotifyManager::new(
            api.clone(),
            clock.clone(),
            Duration::from_secs(30),
        ));
        let wakeup = Arc::new(WakeupManager::new(
            api.clone(),
            clock.clone(),
            Duration::from_secs(1),
        ));
        let upstreams = Arc::new(
            UpstreamManager::new(
                resolver.clone(),
                notify,
                wakeup,
                UpstreamSettings {
                    response_header_timeout: Duration::from_secs(5),
                    ..Default::default()
                },
            )
            .unwrap(),
        );
        let handlers = AppHandlerManager::new(AppHandlerDeps {
            flows: Arc::new(FakeFlowFactory),
            upstreams: upstreams.clone(),
            clock: clock.clone(),
            auth: AuthHandlerSettings {
                cookie_secret_salt: "test-salt".into(),
                session_ttl: Duration::from_secs(3600),
                headers: IdentityHeaders::new("X-Kbc-").unwrap(),
            },
        });
        let configs = Arc::new(ConfigCache::new(api, clock));
        let router =
            Arc::new(ProxyRouter::new(PUBLIC_DOMAIN, configs, Arc::new(handlers))).into_router();

        Self {
            router,
            control_plane,
            resolver,
            upstreams,
            upstream_port,
        }
    }

    /// Upstream URL on a host that resolves only once [`Harness::add_dns`]
    /// is called for it.
    pub fn upstream_url(&self, host: &str) -> String {
        format!("http://{host}:{}", self.upstream_port)
    }

    pub fn add_dns(&self, host: &str) {
        self.resolver
            .insert(host, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    /// Waits for background notify/wakeup calls spawned so far.
    pub async fn drain(&self) {
        self.upstreams.drain().await;
    }
}

/// Public-domain host of an app.
pub fn app_host(app_id: &str) -> String {
    format!("app-{app_id}.{PUBLIC_DOMAIN}")
}

pub fn request(app_id: &str, path: &str, jar: &CookieJar) -> Request<Body> {
    let mut builder = Request::builder()
        .uri(path)
        .header(header::HOST, app_host(app_id));
    if let Some(cookie) = jar.header() {
        builder = builder.header(header::COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub fn query_value(url: &str, name: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

/// Minimal browser cookie jar: applies `Set-Cookie`, honouring removals.
#[derive(Debug, Default, Clone)]
pub struct CookieJar {
    cookies: Vec<(String, String)>,
}

impl CookieJar {
    pub fn apply(&mut self, response: &Response<Body>) {
        for value in response.headers().get_all(header::SET_COOKIE) {
            let Ok(cookie) = Cookie::parse(value.to_str().unwrap().to_string()) else {
                continue;
            };
            self.cookies.retain(|(name, _)| name != cookie.name());
            let removed = cookie
                .max_age()
                .is_some_and(|age| age.is_zero() || age.is_negative());
            if !removed {
                self.cookies
                    .push((cookie.name().to_string(), cookie.value().to_string()));
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn header(&self) -> Option<String> {
        (!self.cookies.is_empty()).then(|| {
            self.cookies
                .iter()
                .map(|(n, v)| format!("{n}={v}"))
                .collect::<Vec<_>>()
                .join("; ")
        })
    }
}

pub fn public_app(upstream: &str) -> serde_json::Value {
    serde_json::json!({
        "name": "Public App",
        "upstreamAppUrl": upstream,
        "authProviders": [],
        "authRules": [{ "type": "pathPrefix", "value": "/", "authRequired": false }],
    })
}

pub fn oidc_provider(id: &str, allowed_roles: Option<&[&str]>) -> serde_json::Value {
    let mut provider = serde_json::json!({
        "id": id,
        "name": format!("Provider {id}"),
        "type": "oidc",
        "clientId": "client",
        "clientSecret": "secret",
        "issuerUrl": "https://idp.test",
    });
    if let Some(roles) = allowed_roles {
        provider["allowedRoles"] = serde_json::json!(roles);
    }
    provider
}
