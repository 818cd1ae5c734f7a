//! Authentication: identity flows, the per-provider [`AuthHandler`] and the
//! multi-provider [`Selector`].
//!
//! All internal endpoints live under [`INTERNAL_PREFIX`]; everything else is
//! app traffic.
pub mod basic;
pub mod flow;
pub mod github;
pub mod handler;
pub mod oidc;
pub mod selector;

use axum::{
    body::Body,
    http::{HeaderValue, Request, Response, StatusCode, header},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};

pub use flow::{
    AuthError, CallbackContext, DefaultFlowFactory, FlowFactory, Identity, IdentityFlow,
    LoginAction, LoginStart,
};
pub use handler::{AuthHandler, AuthHandlerSettings, IdentityHeaders, NeedsLogin};
pub use selector::Selector;

use crate::core::app_id::strip_port;

pub const INTERNAL_PREFIX: &str = "/_proxy/";
pub const SIGN_IN_PATH: &str = "/_proxy/sign_in";
pub const CALLBACK_PATH: &str = "/_proxy/callback";
pub const SIGN_OUT_PATH: &str = "/_proxy/sign_out";
pub const SELECTION_PATH: &str = "/_proxy/selection";

pub const SESSION_COOKIE: &str = "_proxy_session";
pub const CSRF_COOKIE: &str = "_proxy_csrf";
pub const SELECTION_COOKIE: &str = "_proxy_provider";

pub fn is_internal_path(path: &str) -> bool {
    path.starts_with(INTERNAL_PREFIX) || path == "/_proxy"
}

/// Request host without port, from the `Host` header or the URI.
pub(crate) fn request_host(req: &Request<Body>) -> String {
    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().host())
        .unwrap_or_default();
    strip_port(host).to_string()
}

/// Request host including any port, used to build absolute URLs.
pub(crate) fn request_authority(req: &Request<Body>) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default()
}

pub(crate) fn query_param(req: &Request<Body>, name: &str) -> Option<String> {
    let query = req.uri().query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

pub(crate) fn cookie_value(req: &Request<Body>, name: &str) -> Option<String> {
    CookieJar::from_headers(req.headers())
        .get(name)
        .map(|cookie| cookie.value().to_string())
}

/// Cookie scoped to the request host: `Path=/`, `Secure`, `HttpOnly`.
pub(crate) fn host_cookie(
    name: &'static str,
    value: String,
    host: &str,
    max_age: chrono::TimeDelta,
    same_site: SameSite,
) -> Cookie<'static> {
    Cookie::build((name, value))
        .domain(host.to_string())
        .path("/")
        .secure(true)
        .http_only(true)
        .same_site(same_site)
        .max_age(time::Duration::seconds(max_age.num_seconds()))
        .build()
}

/// Expired cookie telling the browser to drop `name`.
pub(crate) fn removal_cookie(name: &'static str, host: &str, same_site: SameSite) -> Cookie<'static> {
    let mut cookie = host_cookie(name, String::new(), host, chrono::TimeDelta::zero(), same_site);
    cookie.make_removal();
    cookie
}

pub(crate) fn append_cookie(response: &mut Response<Body>, cookie: &Cookie<'_>) {
    if let Ok(value) = HeaderValue::from_str(&cookie.to_string()) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
}

pub(crate) fn redirect(location: &str) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

/// Path and query of the request, used as the post-login redirect target.
pub(crate) fn original_target(req: &Request<Body>) -> String {
    req.uri()
        .path_and_query()
        .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str, host: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, host)
            .header(header::COOKIE, "a=1; _proxy_provider=oidc")
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_request_helpers() {
        let req = request("/_proxy/sign_in?rd=%2Fdata&x=1", "app-1.hub.local:8443");
        assert_eq!(request_host(&req), "app-1.hub.local");
        assert_eq!(request_authority(&req), "app-1.hub.local:8443");
        assert_eq!(query_param(&req, "rd").as_deref(), Some("/data"));
        assert_eq!(query_param(&req, "missing"), None);
        assert_eq!(cookie_value(&req, SELECTION_COOKIE).as_deref(), Some("oidc"));
        assert_eq!(original_target(&req), "/_proxy/sign_in?rd=%2Fdata&x=1");
        assert!(is_internal_path(req.uri().path()));
        assert!(!is_internal_path("/_proxyfoo"));
    }

    #[test]
    fn test_cookie_attributes() {
        let cookie = host_cookie(
            SELECTION_COOKIE,
            "oidc".into(),
            "app-1.hub.local",
            chrono::TimeDelta::hours(1),
            SameSite::Strict,
        )
        .to_string();
        assert!(cookie.starts_with("_proxy_provider=oidc"));
        assert!(cookie.contains("Domain=app-1.hub.local"));
        assert!(cookie.contains("Path=/"));
        assert!(cookie.contains("Secure"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Strict"));
        assert!(cookie.contains("Max-Age=3600"));

        let removal = removal_cookie(SELECTION_COOKIE, "app-1.hub.local", SameSite::Strict).to_string();
        assert!(removal.contains("Max-Age=0"));
    }
}
