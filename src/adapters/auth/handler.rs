//! Authentication handler for one `(app, provider)` pair.
use std::{sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Request, Response, StatusCode, header},
};
use axum_extra::extract::cookie::{Cookie, SameSite};
use chrono::TimeDelta;

use super::{
    CALLBACK_PATH, CSRF_COOKIE, SESSION_COOKIE, SIGN_IN_PATH, SIGN_OUT_PATH,
    flow::{CallbackContext, IdentityFlow, LoginAction},
    append_cookie, cookie_value, host_cookie, is_internal_path, original_target, query_param,
    redirect, removal_cookie, request_authority, request_host,
};
use crate::{
    adapters::{pages, upstream::AppUpstream},
    core::{
        AppId, CookieCodec, EngineOptions, PendingLogin, ProxyError, Session, derive_cookie_secret,
        session::{roles_allowed, sanitize_redirect},
    },
    ports::Clock,
};

/// Lifetime of the CSRF cookie between sign-in and callback.
const CSRF_TTL: TimeDelta = TimeDelta::minutes(15);

/// Called instead of starting a login when a request has no valid session.
pub type NeedsLogin<'a> = &'a (dyn Fn(&Request<Body>) -> Response<Body> + Send + Sync);

/// Names of the identity headers sent upstream.
#[derive(Debug, Clone)]
pub struct IdentityHeaders {
    pub prefix: String,
    pub user: HeaderName,
    pub email: HeaderName,
    pub roles: HeaderName,
}

impl IdentityHeaders {
    pub fn new(prefix: &str) -> Result<Self, header::InvalidHeaderName> {
        Ok(Self {
            prefix: prefix.to_ascii_lowercase(),
            user: HeaderName::from_bytes(format!("{prefix}User").as_bytes())?,
            email: HeaderName::from_bytes(format!("{prefix}User-Email").as_bytes())?,
            roles: HeaderName::from_bytes(format!("{prefix}User-Roles").as_bytes())?,
        })
    }
}

/// Settings shared by every auth handler of the process.
#[derive(Debug, Clone)]
pub struct AuthHandlerSettings {
    pub cookie_secret_salt: String,
    pub session_ttl: Duration,
    pub headers: IdentityHeaders,
}

/// Request data a login needs after the request itself is gone: the callback
/// URL handed to the identity provider and the host the CSRF cookie is set on.
#[derive(Debug, Clone)]
pub struct LoginOrigin {
    pub callback_url: String,
    pub host: String,
}

impl LoginOrigin {
    pub fn of(req: &Request<Body>) -> Self {
        Self {
            callback_url: callback_url(req),
            host: request_host(req),
        }
    }
}

pub struct AuthHandler {
    app_id: AppId,
    app_name: String,
    provider_id: String,
    provider_name: String,
    flow: Arc<dyn IdentityFlow>,
    codec: CookieCodec,
    session_ttl: TimeDelta,
    allowed_roles: Option<Vec<String>>,
    headers: IdentityHeaders,
    upstream: Arc<AppUpstream>,
    clock: Arc<dyn Clock>,
}

impl AuthHandler {
    pub fn new(
        app_id: &AppId,
        app_name: &str,
        options: &EngineOptions,
        flow: Arc<dyn IdentityFlow>,
        upstream: Arc<AppUpstream>,
        clock: Arc<dyn Clock>,
        settings: &AuthHandlerSettings,
    ) -> Self {
        let secret = derive_cookie_secret(app_id, &options.provider_id, &settings.cookie_secret_salt);
        Self {
            app_id: app_id.clone(),
            app_name: app_name.to_string(),
            provider_id: options.provider_id.clone(),
            provider_name: options.provider_name.clone(),
            flow,
            codec: CookieCodec::new(secret),
            session_ttl: TimeDelta::from_std(settings.session_ttl).unwrap_or(TimeDelta::days(7)),
            allowed_roles: options.allowed_roles.clone(),
            headers: settings.headers.clone(),
            upstream,
            clock,
        }
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    /// Lifetime of the session cookie.
    pub fn cookie_expiration(&self) -> TimeDelta {
        self.session_ttl
    }

    /// Serves internal auth endpoints, or forwards authenticated traffic
    /// upstream. Without a session the request goes to `needs_login` when
    /// given, otherwise a new login starts.
    pub async fn serve(
        &self,
        req: Request<Body>,
        needs_login: Option<NeedsLogin<'_>>,
    ) -> Result<Response<Body>, ProxyError> {
        let path = req.uri().path().to_string();
        match path.as_str() {
            SIGN_IN_PATH => {
                let redirect_to =
                    sanitize_redirect(&query_param(&req, "rd").unwrap_or_else(|| "/".to_string()));
                self.sign_in(LoginOrigin::of(&req), &redirect_to).await
            }
            CALLBACK_PATH => self.callback(req).await,
            SIGN_OUT_PATH => Ok(self.sign_out(&req)),
            path if is_internal_path(path) => {
                Err(ProxyError::not_found(format!("Route \"{path}\" not found.")))
            }
            _ => match self.session(&req) {
                Some(session) if roles_allowed(self.allowed_roles.as_deref(), &session.roles) => {
                    self.forward(req, session).await
                }
                Some(session) => {
                    tracing::info!(
                        app_id = %self.app_id,
                        provider_id = %self.provider_id,
                        user = %session.user,
                        "Session roles no longer allowed"
                    );
                    Err(ProxyError::auth(
                        StatusCode::FORBIDDEN,
                        "You are not allowed to access this application.",
                    ))
                }
                None => match needs_login {
                    Some(needs_login) => Ok(needs_login(&req)),
                    None => {
                        let redirect_to = original_target(&req);
                        self.sign_in(LoginOrigin::of(&req), &redirect_to).await
                    }
                },
            },
        }
    }

    /// Starts a login that returns to `redirect_to`.
    pub async fn sign_in(
        &self,
        origin: LoginOrigin,
        redirect_to: &str,
    ) -> Result<Response<Body>, ProxyError> {
        let start = self
            .flow
            .begin(&origin.callback_url, redirect_to)
            .await
            .map_err(|err| {
                tracing::error!(app_id = %self.app_id, provider_id = %self.provider_id, error = %err, "Unable to start login");
                ProxyError::from(err)
            })?;

        let mut response = match &start.action {
            LoginAction::Redirect(location) => redirect(location),
            LoginAction::PasswordForm => pages::password_form(
                &self.app_name,
                &self.provider_name,
                CALLBACK_PATH,
                &start.pending.state,
            ),
        };
        let pending = self
            .codec
            .seal(&start.pending)
            .map_err(|e| ProxyError::Internal(e.to_string()))?;
        append_cookie(
            &mut response,
            &host_cookie(CSRF_COOKIE, pending, &origin.host, CSRF_TTL, SameSite::Lax),
        );
        Ok(response)
    }

    /// True when the request carries a CSRF cookie sealed by this handler.
    pub fn owns_pending_login(&self, req: &Request<Body>) -> bool {
        self.pending_login(req).is_some()
    }

    /// Cookies that end any session of this app, whatever the provider.
    pub fn session_removal_cookies(host: &str) -> [Cookie<'static>; 2] {
        [
            removal_cookie(SESSION_COOKIE, host, SameSite::Lax),
            removal_cookie(CSRF_COOKIE, host, SameSite::Lax),
        ]
    }

    async fn callback(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let host = request_host(&req);
        let Some(pending) = self.pending_login(&req) else {
            return Err(ProxyError::auth(
                StatusCode::FORBIDDEN,
                "Login expired or CSRF cookie missing, please sign in again.",
            ));
        };
        let redirect_to = sanitize_redirect(&pending.redirect_to);
        let context = CallbackContext {
            redirect_uri: callback_url(&req),
            pending,
        };

        let identity = self.flow.complete(req, context).await.map_err(|err| {
            tracing::warn!(app_id = %self.app_id, provider_id = %self.provider_id, error = %err, "Login failed");
            ProxyError::from(err)
        })?;

        if !roles_allowed(self.allowed_roles.as_deref(), &identity.roles) {
            tracing::info!(
                app_id = %self.app_id,
                provider_id = %self.provider_id,
                user = %identity.user,
                "User has none of the allowed roles"
            );
            return Err(ProxyError::auth(
                StatusCode::FORBIDDEN,
                "You are not allowed to access this application.",
            ));
        }

        let session = Session {
            user: identity.user,
            email: identity.email,
            roles: identity.roles,
            expires_at: self.clock.now() + self.session_ttl,
        };
        let value = self
            .codec
            .encode(&session)
            .map_err(|e| ProxyError::Internal(e.to_string()))?;

        tracing::info!(app_id = %self.app_id, provider_id = %self.provider_id, user = %session.user, "User signed in");
        let mut response = redirect(&redirect_to);
        append_cookie(
            &mut response,
            &host_cookie(SESSION_COOKIE, value, &host, self.session_ttl, SameSite::Lax),
        );
        append_cookie(&mut response, &removal_cookie(CSRF_COOKIE, &host, SameSite::Lax));
        Ok(response)
    }

    fn sign_out(&self, req: &Request<Body>) -> Response<Body> {
        let host = request_host(req);
        let mut response = redirect(self.flow.logout_url().unwrap_or("/"));
        for cookie in Self::session_removal_cookies(&host) {
            append_cookie(&mut response, &cookie);
        }
        response
    }

    fn session(&self, req: &Request<Body>) -> Option<Session> {
        let raw = cookie_value(req, SESSION_COOKIE)?;
        let session: Session = self.codec.decode(&raw).ok()?;
        (!session.is_expired(self.clock.now())).then_some(session)
    }

    fn pending_login(&self, req: &Request<Body>) -> Option<PendingLogin> {
        let raw = cookie_value(req, CSRF_COOKIE)?;
        self.codec.open(&raw).ok()
    }

    async fn forward(
        &self,
        mut req: Request<Body>,
        session: Session,
    ) -> Result<Response<Body>, ProxyError> {
        let headers = req.headers_mut();
        strip_proxy_cookies(headers);

        let mut set = |name: &HeaderName, value: &str| match HeaderValue::from_str(value) {
            Ok(value) => {
                headers.insert(name.clone(), value);
            }
            Err(_) => {
                tracing::warn!(app_id = %self.app_id, header = %name, "Identity value is not a valid header value");
            }
        };
        set(&self.headers.user, &session.user);
        if let Some(email) = &session.email {
            set(&self.headers.email, email);
        }
        if !session.roles.is_empty() {
            set(&self.headers.roles, &session.roles.join(","));
        }

        self.upstream.serve(req).await
    }
}

/// Absolute callback URL on the request's host.
fn callback_url(req: &Request<Body>) -> String {
    let proto = req
        .headers()
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("https");
    format!("{proto}://{}{CALLBACK_PATH}", request_authority(req))
}

/// Drops the proxy's own cookies before a request goes upstream.
fn strip_proxy_cookies(headers: &mut axum::http::HeaderMap) {
    let kept: Vec<String> = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .map(str::trim)
        .filter(|pair| !pair.is_empty() && !pair.starts_with("_proxy_"))
        .map(str::to_string)
        .collect();

    headers.remove(header::COOKIE);
    if !kept.is_empty()
        && let Ok(value) = HeaderValue::from_str(&kept.join("; "))
    {
        headers.insert(header::COOKIE, value);
    }
}
