//! Chooses among several auth handlers for one app rule.
//!
//! The chosen provider is remembered in the selection cookie. With a single
//! provider the choice is implicit and the selection page never shows up.
use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, Response, StatusCode},
};
use axum_extra::extract::cookie::SameSite;

use super::{
    CALLBACK_PATH, SELECTION_COOKIE, SELECTION_PATH, SIGN_IN_PATH, SIGN_OUT_PATH,
    append_cookie, cookie_value, handler::{AuthHandler, LoginOrigin}, host_cookie, is_internal_path,
    original_target, query_param, redirect, removal_cookie, request_host,
};
use crate::{
    adapters::pages::{self, ProviderLink},
    core::{ProxyError, session::sanitize_redirect},
};

pub struct Selector {
    app_name: String,
    handlers: Vec<Arc<AuthHandler>>,
}

impl Selector {
    pub fn new(app_name: &str, handlers: Vec<Arc<AuthHandler>>) -> Self {
        Self {
            app_name: app_name.to_string(),
            handlers,
        }
    }

    pub async fn serve(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let path = req.uri().path().to_string();
        match path.as_str() {
            SELECTION_PATH => return self.select(req).await,
            SIGN_OUT_PATH => return self.sign_out(req).await,
            _ => {}
        }

        let (handler, remember) = match self.selected(&req) {
            Some(handler) => (handler, false),
            None if self.handlers.len() == 1 => (self.handlers[0].clone(), true),
            None if path == CALLBACK_PATH => {
                match self.handlers.iter().find(|h| h.owns_pending_login(&req)) {
                    Some(handler) => (handler.clone(), true),
                    None => {
                        return Err(ProxyError::auth(
                            StatusCode::FORBIDDEN,
                            "Login expired or CSRF cookie missing, please sign in again.",
                        ));
                    }
                }
            }
            None if path != SIGN_IN_PATH && is_internal_path(&path) => {
                return Err(ProxyError::not_found(format!("Route \"{path}\" not found.")));
            }
            None => {
                let redirect_to = if path == SIGN_IN_PATH {
                    sanitize_redirect(&query_param(&req, "rd").unwrap_or_else(|| "/".to_string()))
                } else {
                    original_target(&req)
                };
                return Ok(self.selection_page(&redirect_to, StatusCode::UNAUTHORIZED));
            }
        };

        let host = request_host(&req);
        let needs_login = |req: &Request<Body>| self.needs_login(req);
        let mut response = if self.handlers.len() > 1 {
            handler.serve(req, Some(&needs_login)).await?
        } else {
            handler.serve(req, None).await?
        };
        if remember {
            append_cookie(&mut response, &self.selection_cookie(&host, &handler));
        }
        Ok(response)
    }

    /// Handles `/_proxy/selection`: either the page or a concrete choice.
    async fn select(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let redirect_to =
            sanitize_redirect(&query_param(&req, "rd").unwrap_or_else(|| "/".to_string()));
        let chosen = query_param(&req, "provider").and_then(|id| self.handler(&id));
        let Some(handler) = chosen else {
            return Ok(self.selection_page(&redirect_to, StatusCode::OK));
        };

        tracing::debug!(provider_id = %handler.provider_id(), "Provider selected");
        let origin = LoginOrigin::of(&req);
        let host = origin.host.clone();
        let mut response = handler.sign_in(origin, &redirect_to).await?;
        append_cookie(&mut response, &self.selection_cookie(&host, &handler));
        Ok(response)
    }

    async fn sign_out(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let host = request_host(&req);
        let mut response = match self.selected(&req) {
            Some(handler) => handler.serve(req, None).await?,
            None => {
                let mut response = redirect("/");
                for cookie in AuthHandler::session_removal_cookies(&host) {
                    append_cookie(&mut response, &cookie);
                }
                response
            }
        };
        append_cookie(
            &mut response,
            &removal_cookie(SELECTION_COOKIE, &host, SameSite::Strict),
        );
        Ok(response)
    }

    /// Session missing under a remembered provider: forget the choice and ask
    /// again.
    fn needs_login(&self, req: &Request<Body>) -> Response<Body> {
        let mut response = self.selection_page(&original_target(req), StatusCode::UNAUTHORIZED);
        append_cookie(
            &mut response,
            &removal_cookie(SELECTION_COOKIE, &request_host(req), SameSite::Strict),
        );
        response
    }

    fn selected(&self, req: &Request<Body>) -> Option<Arc<AuthHandler>> {
        cookie_value(req, SELECTION_COOKIE).and_then(|id| self.handler(&id))
    }

    fn handler(&self, id: &str) -> Option<Arc<AuthHandler>> {
        self.handlers.iter().find(|h| h.provider_id() == id).cloned()
    }

    fn selection_cookie(&self, host: &str, handler: &AuthHandler) -> axum_extra::extract::cookie::Cookie<'static> {
        host_cookie(
            SELECTION_COOKIE,
            handler.provider_id().to_string(),
            host,
            handler.cookie_expiration(),
            SameSite::Strict,
        )
    }

    fn selection_page(&self, redirect_to: &str, status: StatusCode) -> Response<Body> {
        let links: Vec<ProviderLink<'_>> = self
            .handlers
            .iter()
            .map(|h| ProviderLink {
                id: h.provider_id(),
                name: h.provider_name(),
            })
            .collect();
        pages::selection_page(&self.app_name, &links, redirect_to, status)
    }
}
