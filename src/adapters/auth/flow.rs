//! The narrow contract between the proxy and identity-provider protocols.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use rand::Rng;
use thiserror::Error;

use super::{basic::BasicFlow, github::GitHubFlow, oidc::OidcFlow};
use crate::core::{EngineKind, EngineOptions, PendingLogin, ProxyError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Malformed callback (missing code, state mismatch).
    #[error("{0}")]
    BadRequest(String),
    /// The provider or the user rejected the login.
    #[error("{0}")]
    Unauthorized(String),
    /// Authenticated, but not allowed in.
    #[error("{0}")]
    Forbidden(String),
    /// Talking to the provider failed.
    #[error("{0}")]
    Provider(String),
    /// The provider options are unusable.
    #[error("{0}")]
    Configuration(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AuthError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden(_) => StatusCode::FORBIDDEN,
            AuthError::Provider(_) | AuthError::Configuration(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<AuthError> for ProxyError {
    fn from(err: AuthError) -> Self {
        ProxyError::auth(err.status(), err.to_string())
    }
}

/// Who logged in, as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginAction {
    /// Send the browser to the provider.
    Redirect(String),
    /// Ask for a password locally.
    PasswordForm,
}

/// Start of a login. `pending` goes into the signed CSRF cookie and comes
/// back as [`CallbackContext::pending`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub action: LoginAction,
    pub pending: PendingLogin,
}

#[derive(Debug, Clone)]
pub struct CallbackContext {
    pub redirect_uri: String,
    pub pending: PendingLogin,
}

#[async_trait]
pub trait IdentityFlow: Send + Sync + 'static {
    /// Starts a login that will come back to `redirect_uri` and finally
    /// land on `redirect_to`.
    async fn begin(&self, redirect_uri: &str, redirect_to: &str) -> Result<LoginStart, AuthError>;

    /// Finishes a login from the callback request.
    async fn complete(&self, req: Request<Body>, ctx: CallbackContext) -> Result<Identity, AuthError>;

    /// Provider-side logout URL to visit after the local session is dropped.
    fn logout_url(&self) -> Option<&str> {
        None
    }
}

/// Builds flows from provider options when an app handler is built.
#[async_trait]
pub trait FlowFactory: Send + Sync + 'static {
    async fn create(&self, options: &EngineOptions) -> Result<Arc<dyn IdentityFlow>, AuthError>;
}

/// Production factory: OIDC discovery, GitHub OAuth and password flows.
pub struct DefaultFlowFactory {
    http: reqwest::Client,
}

impl DefaultFlowFactory {
    pub fn new(timeout: Duration) -> eyre::Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .user_agent(concat!("appsproxy/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl FlowFactory for DefaultFlowFactory {
    async fn create(&self, options: &EngineOptions) -> Result<Arc<dyn IdentityFlow>, AuthError> {
        match &options.kind {
            EngineKind::Oidc(oidc) => Ok(Arc::new(
                OidcFlow::discover(oidc.clone(), self.http.clone()).await?,
            )),
            EngineKind::GitHub(github) => {
                Ok(Arc::new(GitHubFlow::new(github.clone(), self.http.clone())?))
            }
            EngineKind::Basic(basic) => Ok(Arc::new(BasicFlow::new(basic)?)),
        }
    }
}

/// Random URL-safe token for CSRF state.
pub fn random_token() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    hex::encode(bytes)
}

/// Fails unless the callback state matches the pending login.
pub fn check_state(received: Option<&str>, pending: &PendingLogin) -> Result<(), AuthError> {
    match received {
        Some(state) if state == pending.state => Ok(()),
        Some(_) => Err(AuthError::BadRequest("invalid CSRF state".to_string())),
        None => Err(AuthError::BadRequest("missing CSRF state".to_string())),
    }
}
