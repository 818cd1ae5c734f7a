//! Error taxonomy shared by every request-serving stage.
//!
//! Errors are `Clone` so a failed handler build can be cached per app and
//! replayed on each request without re-running construction.
use http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use super::app_id::AppId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    #[error("{message}")]
    NotFound { message: String },

    #[error("unable to find application ID in host \"{host}\"")]
    MissingAppId { host: String },

    #[error("application \"{app_id}\" has invalid configuration: {reason}")]
    InvalidConfiguration {
        app_id: AppId,
        reason: String,
        exception_id: String,
    },

    #[error("unable to load configuration for application \"{app_id}\": {reason}")]
    ControlPlaneUnavailable {
        app_id: AppId,
        reason: String,
        exception_id: String,
    },

    #[error("application \"{app_id}\" is starting")]
    AppStarting { app_id: AppId },

    #[error("request to application \"{app_id}\" failed: {reason}")]
    UpstreamUnavailable { app_id: AppId, reason: String },

    #[error("request to application \"{app_id}\" timed out")]
    UpstreamTimeout { app_id: AppId },

    #[error("{message}")]
    Auth { status: u16, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn invalid_configuration(app_id: &AppId, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            app_id: app_id.clone(),
            reason: reason.into(),
            exception_id: new_exception_id(),
        }
    }

    pub fn control_plane_unavailable(app_id: &AppId, reason: impl Into<String>) -> Self {
        Self::ControlPlaneUnavailable {
            app_id: app_id.clone(),
            reason: reason.into(),
            exception_id: new_exception_id(),
        }
    }

    pub fn auth(status: StatusCode, message: impl Into<String>) -> Self {
        Self::Auth {
            status: status.as_u16(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound { .. } | Self::MissingAppId { .. } => StatusCode::NOT_FOUND,
            Self::InvalidConfiguration { .. }
            | Self::ControlPlaneUnavailable { .. }
            | Self::AppStarting { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Auth { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Support correlation ID, shown on the error page.
    pub fn exception_id(&self) -> Option<&str> {
        match self {
            Self::InvalidConfiguration { exception_id, .. }
            | Self::ControlPlaneUnavailable { exception_id, .. } => Some(exception_id),
            _ => None,
        }
    }

    /// Short page title.
    pub fn title(&self) -> &'static str {
        match self {
            Self::NotFound { .. } | Self::MissingAppId { .. } => "Not found",
            Self::InvalidConfiguration { .. } => "Application has invalid configuration",
            Self::ControlPlaneUnavailable { .. } => "Service unavailable",
            Self::AppStarting { .. } => "Application is starting",
            Self::UpstreamUnavailable { .. } => "Request to application failed",
            Self::UpstreamTimeout { .. } => "Application did not respond in time",
            Self::Auth { .. } => "Authentication failed",
            Self::Internal(_) => "Internal error",
        }
    }

    /// Message safe to show to end users. Internal reasons stay in logs.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidConfiguration { app_id, .. } => {
                format!("Application \"{app_id}\" has invalid configuration.")
            }
            Self::ControlPlaneUnavailable { app_id, .. } => {
                format!("Unable to load configuration for application \"{app_id}\".")
            }
            Self::UpstreamUnavailable { app_id, .. } => {
                format!("Request to application \"{app_id}\" failed.")
            }
            Self::Internal(_) => "Internal server error.".to_string(),
            other => other.to_string(),
        }
    }
}

fn new_exception_id() -> String {
    format!("exception-{}", Uuid::new_v4())
}
