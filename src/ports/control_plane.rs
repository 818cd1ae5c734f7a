use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::core::{AppConfig, AppId};

/// Errors returned by the control-plane API.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ControlPlaneError {
    /// The app does not exist (HTTP 404).
    #[error("application \"{app_id}\" not found")]
    NotFound { app_id: AppId },

    /// The API answered with an unexpected status code.
    #[error("control plane returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The request never produced a response.
    #[error("control plane request failed: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("invalid control plane response: {0}")]
    Decode(String),
}

/// Outcome of a conditional configuration fetch.
#[derive(Debug, Clone)]
pub enum ConfigFetch {
    /// The ETag still matches; the cached value remains valid for `max_age`.
    NotModified { max_age: std::time::Duration },
    /// A fresh body. ETag and max-age are captured on the config itself.
    Modified(AppConfig),
}

/// Partial update sent with `PATCH /apps/{appID}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AppPatch {
    LastRequest {
        #[serde(rename = "lastRequestTimestamp")]
        last_request_timestamp: String,
    },
    DesiredState {
        #[serde(rename = "desiredState")]
        desired_state: String,
    },
}

impl AppPatch {
    pub fn last_request(at: DateTime<Utc>) -> Self {
        AppPatch::LastRequest {
            last_request_timestamp: at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }

    pub fn running() -> Self {
        AppPatch::DesiredState {
            desired_state: "running".to_string(),
        }
    }
}

/// ControlPlane defines the port for talking back to the data-apps API.
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// `GET /apps/{appID}/proxy-config`, conditional on `etag` when present.
    async fn get_app_config(
        &self,
        app_id: &AppId,
        etag: Option<&str>,
    ) -> Result<ConfigFetch, ControlPlaneError>;

    /// `PATCH /apps/{appID}`.
    async fn patch_app(&self, app_id: &AppId, patch: &AppPatch) -> Result<(), ControlPlaneError>;
}
