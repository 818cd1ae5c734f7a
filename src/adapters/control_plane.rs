//! reqwest-backed client for the data-apps control-plane API.
use std::time::Duration;

use async_trait::async_trait;
use eyre::{Context, Result};
use reqwest::{Client, StatusCode, header};

use crate::{
    core::{AppConfig, AppId, config_cache::parse_cache_control},
    ports::{AppPatch, ConfigFetch, ControlPlane, ControlPlaneError},
};

/// Header carrying the API token.
pub const API_TOKEN_HEADER: &str = "X-KBC-ManageApiToken";

pub struct HttpControlPlane {
    base_url: String,
    token: String,
    client: Client,
}

impl HttpControlPlane {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("appsproxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build control plane HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            client,
        })
    }

    fn app_url(&self, app_id: &AppId) -> String {
        format!(
            "{}/apps/{}",
            self.base_url,
            urlencoding::encode(app_id.as_str())
        )
    }
}

fn cache_max_age(headers: &header::HeaderMap) -> Duration {
    headers
        .get(header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .map(parse_cache_control)
        .unwrap_or(Duration::ZERO)
}

fn transport(err: reqwest::Error) -> ControlPlaneError {
    ControlPlaneError::Transport(err.to_string())
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn get_app_config(
        &self,
        app_id: &AppId,
        etag: Option<&str>,
    ) -> Result<ConfigFetch, ControlPlaneError> {
        let mut request = self
            .client
            .get(format!("{}/proxy-config", self.app_url(app_id)))
            .header(API_TOKEN_HEADER, &self.token);
        if let Some(etag) = etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }

        let response = request.send().await.map_err(transport)?;
        let status = response.status();
        let max_age = cache_max_age(response.headers());

        match status {
            StatusCode::NOT_MODIFIED => Ok(ConfigFetch::NotModified { max_age }),
            StatusCode::NOT_FOUND => Err(ControlPlaneError::NotFound {
                app_id: app_id.clone(),
            }),
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let mut config = response
                    .json::<AppConfig>()
                    .await
                    .map_err(|e| ControlPlaneError::Decode(e.to_string()))?;
                config.etag = etag;
                config.max_age = max_age;
                Ok(ConfigFetch::Modified(config))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ControlPlaneError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    async fn patch_app(&self, app_id: &AppId, patch: &AppPatch) -> Result<(), ControlPlaneError> {
        let response = self
            .client
            .patch(self.app_url(app_id))
            .header(API_TOKEN_HEADER, &self.token)
            .json(patch)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ControlPlaneError::NotFound {
                app_id: app_id.clone(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ControlPlaneError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}
