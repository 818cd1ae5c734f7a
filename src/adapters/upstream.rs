//! Reverse proxy to app upstreams (HTTP and WebSocket).
//!
//! One hyper client is shared by every app. Each app handler build gets its
//! own [`AppUpstream`] with a cancellation token; background notify/wakeup
//! calls it spawns run on the manager's [`TaskTracker`] so shutdown can wait
//! for them.
use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, header},
};
use eyre::Result;
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{
        Client,
        connect::{HttpConnector, capture_connection},
    },
    rt::{TokioExecutor, TokioIo},
};
use rustls_native_certs::load_native_certs;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    adapters::dns::{ResolverService, find_dns_error},
    core::{AppId, NotifyManager, ProxyError, WakeupManager},
    metrics,
    ports::Resolve,
};

pub type UpstreamClient = Client<HttpsConnector<HttpConnector<ResolverService>>, Body>;

/// Hop-by-hop headers dropped when forwarding plain HTTP.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    pub connect_timeout: Duration,
    pub response_header_timeout: Duration,
    pub notify_timeout: Duration,
    pub wakeup_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            response_header_timeout: Duration::from_secs(60),
            notify_timeout: Duration::from_secs(30),
            wakeup_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

pub struct UpstreamManager {
    client: UpstreamClient,
    notify: Arc<NotifyManager>,
    wakeup: Arc<WakeupManager>,
    tracker: TaskTracker,
    settings: UpstreamSettings,
}

impl UpstreamManager {
    pub fn new(
        resolver: Arc<dyn Resolve>,
        notify: Arc<NotifyManager>,
        wakeup: Arc<WakeupManager>,
        settings: UpstreamSettings,
    ) -> Result<Self> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new_with_resolver(ResolverService::new(resolver));
        http_connector.enforce_http(false);
        http_connector.set_connect_timeout(Some(settings.connect_timeout));

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();
        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        // HTTP/1.1 only: WebSocket upgrades need it.
        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new()).build::<_, Body>(https_connector);

        Ok(Self {
            client,
            notify,
            wakeup,
            tracker: TaskTracker::new(),
            settings,
        })
    }

    /// Creates the upstream for one handler build. Fails on an unusable URL.
    pub fn new_upstream(&self, app_id: &AppId, url: &str) -> Result<Arc<AppUpstream>, ProxyError> {
        let target = parse_target(url).map_err(|reason| {
            ProxyError::invalid_configuration(
                app_id,
                format!("unable to parse upstream url \"{url}\": {reason}"),
            )
        })?;

        Ok(Arc::new(AppUpstream {
            app_id: app_id.clone(),
            target,
            client: self.client.clone(),
            notify: self.notify.clone(),
            wakeup: self.wakeup.clone(),
            tracker: self.tracker.clone(),
            cancel: CancellationToken::new(),
            settings: self.settings.clone(),
        }))
    }

    /// Waits until every background call spawned so far has finished.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stops accepting background work and waits for in-flight calls,
    /// bounded by the shutdown timeout.
    pub async fn shutdown(&self) {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for background control plane calls");
        }
        if tokio::time::timeout(self.settings.shutdown_timeout, self.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                pending = self.tracker.len(),
                "Timed out waiting for background control plane calls"
            );
        }
    }
}

#[derive(Debug, Clone)]
struct Target {
    scheme: String,
    authority: String,
    base_path: String,
}

fn parse_target(url: &str) -> Result<Target, String> {
    let parsed = url::Url::parse(url).map_err(|e| e.to_string())?;
    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(format!("unsupported scheme \"{scheme}\""));
    }
    let host = parsed.host_str().ok_or("missing host")?;
    let authority = match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(Target {
        scheme: scheme.to_string(),
        authority,
        base_path: parsed.path().trim_end_matches('/').to_string(),
    })
}

/// Reverse proxy to one app's upstream.
pub struct AppUpstream {
    app_id: AppId,
    target: Target,
    client: UpstreamClient,
    notify: Arc<NotifyManager>,
    wakeup: Arc<WakeupManager>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    settings: UpstreamSettings,
}

impl AppUpstream {
    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// Cancels background calls tied to this upstream. In-flight requests
    /// keep running.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn serve(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let websocket = is_websocket(req.headers());
        let span = tracing::info_span!(
            "upstream_request",
            app.id = %self.app_id,
            websocket,
            http.method = %req.method(),
            http.status_code = tracing::field::Empty,
        );

        async move {
            let _timer = metrics::UpstreamRequestTimer::new(websocket);
            let result = if websocket {
                self.serve_websocket(req).await
            } else {
                self.serve_http(req).await
            };

            let status = match &result {
                Ok(response) => response.status(),
                Err(err) => err.status(),
            };
            tracing::Span::current().record("http.status_code", status.as_u16());
            metrics::increment_upstream_request_total(websocket, status.as_u16());
            result
        }
        .instrument(span)
        .await
    }

    async fn serve_http(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let (mut parts, body) = req.into_parts();
        parts.uri = self.upstream_uri(&parts.uri)?;
        self.rewrite_headers(&mut parts.headers, parts.extensions.get(), false);

        let response = self.send(Request::from_parts(parts, body)).await?;
        let (mut parts, body) = response.into_parts();
        for name in HOP_BY_HOP {
            parts.headers.remove(name);
        }
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    async fn serve_websocket(&self, mut req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let client_upgrade = hyper::upgrade::on(&mut req);

        let (mut parts, _body) = req.into_parts();
        parts.uri = self.upstream_uri(&parts.uri)?;
        self.rewrite_headers(&mut parts.headers, parts.extensions.get(), true);
        let mut backend_request = Request::new(Body::empty());
        *backend_request.method_mut() = parts.method;
        *backend_request.uri_mut() = parts.uri;
        *backend_request.headers_mut() = parts.headers;

        let mut backend_response = self.send(backend_request).await?;
        if backend_response.status() != StatusCode::SWITCHING_PROTOCOLS {
            let (parts, body) = backend_response.into_parts();
            return Ok(Response::from_parts(parts, Body::new(body)));
        }

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in backend_response.headers() {
            response = response.header(name, value);
        }
        let backend_upgrade = hyper::upgrade::on(&mut backend_response);

        let app_id = self.app_id.clone();
        tokio::spawn(async move {
            match tokio::try_join!(client_upgrade, backend_upgrade) {
                Ok((client, backend)) => {
                    tracing::debug!(app_id = %app_id, "WebSocket tunnel established");
                    let mut client = TokioIo::new(client);
                    let mut backend = TokioIo::new(backend);
                    if let Err(err) = tokio::io::copy_bidirectional(&mut client, &mut backend).await {
                        tracing::debug!(app_id = %app_id, error = %err, "WebSocket tunnel closed with error");
                    }
                }
                Err(err) => {
                    tracing::warn!(app_id = %app_id, error = %err, "Failed to upgrade WebSocket connections");
                }
            }
        });

        response
            .body(Body::empty())
            .map_err(|e| ProxyError::Internal(e.to_string()))
    }

    /// Sends a request upstream. Notify fires once a connection to the
    /// upstream is obtained, even if the response then fails or times out.
    /// Wakeup fires when the upstream host has no DNS record.
    async fn send(
        &self,
        mut req: Request<Body>,
    ) -> Result<Response<hyper::body::Incoming>, ProxyError> {
        let connection = capture_connection(&mut req);
        let result =
            tokio::time::timeout(self.settings.response_header_timeout, self.client.request(req))
                .await;
        if connection.connection_metadata().is_some() {
            self.spawn_notify();
        }

        match result {
            Err(_) => {
                tracing::warn!(app_id = %self.app_id, "Upstream response header timeout");
                Err(ProxyError::UpstreamTimeout {
                    app_id: self.app_id.clone(),
                })
            }
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => match find_dns_error(&err) {
                Some(dns) if dns.is_not_found() => {
                    tracing::info!(app_id = %self.app_id, reason = %dns, "Upstream has no DNS record, waking app");
                    self.spawn_wakeup();
                    Err(ProxyError::AppStarting {
                        app_id: self.app_id.clone(),
                    })
                }
                _ => {
                    tracing::warn!(app_id = %self.app_id, error = ?err, "Upstream request failed");
                    Err(ProxyError::UpstreamUnavailable {
                        app_id: self.app_id.clone(),
                        reason: err.to_string(),
                    })
                }
            },
        }
    }

    fn spawn_notify(&self) {
        let notify = self.notify.clone();
        let app_id = self.app_id.clone();
        let cancel = self.cancel.clone();
        let timeout = self.settings.notify_timeout;
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                result = tokio::time::timeout(timeout, notify.notify(&app_id)) => match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::error!(app_id = %app_id, error = %err, "Notify failed"),
                    Err(_) => tracing::error!(app_id = %app_id, "Notify timed out"),
                },
            }
        });
    }

    fn spawn_wakeup(&self) {
        let wakeup = self.wakeup.clone();
        let app_id = self.app_id.clone();
        let cancel = self.cancel.clone();
        let timeout = self.settings.wakeup_timeout;
        self.tracker.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                result = tokio::time::timeout(timeout, wakeup.wakeup(&app_id)) => match result {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => tracing::error!(app_id = %app_id, error = %err, "Wakeup failed"),
                    Err(_) => tracing::error!(app_id = %app_id, "Wakeup timed out"),
                },
            }
        });
    }

    fn upstream_uri(&self, original: &Uri) -> Result<Uri, ProxyError> {
        let path_and_query = original.path_and_query().map_or("/", |pq| pq.as_str());
        format!(
            "{}://{}{}{}",
            self.target.scheme, self.target.authority, self.target.base_path, path_and_query
        )
        .parse()
        .map_err(|e: http::uri::InvalidUri| ProxyError::Internal(e.to_string()))
    }

    fn rewrite_headers(
        &self,
        headers: &mut HeaderMap,
        connect_info: Option<&ConnectInfo<SocketAddr>>,
        websocket: bool,
    ) {
        let original_host = headers.get(header::HOST).cloned();

        if !websocket {
            for name in HOP_BY_HOP {
                headers.remove(name);
            }
        }

        if let Some(ConnectInfo(addr)) = connect_info {
            let client_ip = addr.ip().to_string();
            let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{existing}, {client_ip}"),
                None => client_ip,
            };
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert("x-forwarded-for", value);
            }
        }
        if let Some(host) = original_host {
            headers.insert("x-forwarded-host", host);
        }
        if !headers.contains_key("x-forwarded-proto") {
            headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        }
        if let Ok(host) = HeaderValue::from_str(&self.target.authority) {
            headers.insert(header::HOST, host);
        }
    }
}

/// `Connection: upgrade` (token match, case-insensitive) plus `Upgrade: websocket`.
pub fn is_websocket(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    connection_upgrade && upgrade_websocket
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use axum::{Router, routing::get};
    use http_body_util::BodyExt;
    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        adapters::dns::StaticResolver,
        ports::{ManualClock, testing::ScriptedControlPlane},
    };

    struct Fixture {
        control_plane: Arc<ScriptedControlPlane>,
        resolver: Arc<StaticResolver>,
        manager: UpstreamManager,
    }

    fn fixture() -> Fixture {
        let control_plane = Arc::new(ScriptedControlPlane::default());
        let clock = Arc::new(ManualClock::default());
        let resolver = Arc::new(StaticResolver::new());
        let notify = Arc::new(NotifyManager::new(
            control_plane.clone(),
            clock.clone(),
            Duration::from_secs(30),
        ));
        let wakeup = Arc::new(WakeupManager::new(
            control_plane.clone(),
            clock,
            Duration::from_secs(1),
        ));
        let manager = UpstreamManager::new(
            resolver.clone(),
            notify,
            wakeup,
            UpstreamSettings {
                response_header_timeout: Duration::from_millis(500),
                ..Default::default()
            },
        )
        .unwrap();
        Fixture {
            control_plane,
            resolver,
            manager,
        }
    }

    async fn start_upstream() -> u16 {
        let app = Router::new()
            .route(
                "/base/hello",
                get(|headers: HeaderMap| async move {
                    let host = headers
                        .get("host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let forwarded = headers
                        .get("x-forwarded-host")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    format!("{host}|{forwarded}")
                }),
            )
            .route(
                "/base/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    "late"
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn request(path: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("host", "myapp-123.hub.example.com")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_is_websocket() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket(&headers));

        headers.remove(header::UPGRADE);
        assert!(!is_websocket(&headers));
    }

    #[test]
    fn test_parse_target() {
        let target = parse_target("http://app.local:8888/base/").unwrap();
        assert_eq!(target.authority, "app.local:8888");
        assert_eq!(target.base_path, "/base");
        assert!(parse_target("not a url").is_err());
        assert!(parse_target("ftp://app.local").is_err());
    }

    #[tokio::test]
    async fn test_invalid_upstream_url_is_invalid_configuration() {
        let fixture = fixture();
        let err = fixture
            .manager
            .new_upstream(&AppId::new("123"), "::nope")
            .err()
            .unwrap();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(err, ProxyError::InvalidConfiguration { .. }));
    }

    #[tokio::test]
    async fn test_proxies_and_notifies() {
        let fixture = fixture();
        let port = start_upstream().await;
        fixture
            .resolver
            .insert("app.local", IpAddr::V4(Ipv4Addr::LOCALHOST));
        let upstream = fixture
            .manager
            .new_upstream(&AppId::new("123"), &format!("http://app.local:{port}/base"))
            .unwrap();

        let response = upstream.serve(request("/hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(
            body,
            format!("app.local:{port}|myapp-123.hub.example.com").as_bytes()
        );

        fixture.manager.drain().await;
        let patches = fixture.control_plane.patches();
        assert_eq!(patches.len(), 1);
        assert!(matches!(patches[0].1, crate::ports::AppPatch::LastRequest { .. }));
    }

    #[tokio::test]
    async fn test_missing_dns_record_wakes_app() {
        let fixture = fixture();
        let upstream = fixture
            .manager
            .new_upstream(&AppId::new("123"), "http://sleeping.local:8080")
            .unwrap();

        let err = upstream.serve(request("/")).await.unwrap_err();
        assert!(matches!(err, ProxyError::AppStarting { .. }));

        fixture.manager.drain().await;
        assert_eq!(
            fixture.control_plane.patches(),
            vec![(AppId::new("123"), crate::ports::AppPatch::running())]
        );
    }

    #[tokio::test]
    async fn test_connection_refused_is_bad_gateway() {
        let fixture = fixture();
        let upstream = fixture
            .manager
            .new_upstream(&AppId::new("123"), "http://127.0.0.1:1")
            .unwrap();

        let err = upstream.serve(request("/")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        fixture.manager.drain().await;
        assert!(fixture.control_plane.patches().is_empty());
    }

    #[tokio::test]
    async fn test_response_header_timeout() {
        let fixture = fixture();
        let port = start_upstream().await;
        let upstream = fixture
            .manager
            .new_upstream(&AppId::new("123"), &format!("http://127.0.0.1:{port}/base"))
            .unwrap();

        let err = upstream.serve(request("/slow")).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);

        // The connection was made, so the app still counts as used.
        fixture.manager.drain().await;
        let patches = fixture.control_plane.patches();
        assert_eq!(patches.len(), 1);
        assert!(matches!(patches[0].1, crate::ports::AppPatch::LastRequest { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_upstream_skips_background_calls() {
        let fixture = fixture();
        let upstream = fixture
            .manager
            .new_upstream(&AppId::new("123"), "http://sleeping.local:8080")
            .unwrap();
        upstream.cancel();

        let _ = upstream.serve(request("/")).await;
        fixture.manager.drain().await;
        assert!(fixture.control_plane.patches().is_empty());
    }
}
