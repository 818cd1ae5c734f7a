//! Per-app request handling: rule matching, authentication and forwarding.
use std::{collections::HashMap, sync::Arc};

use axum::{
    body::Body,
    http::{HeaderMap, Request, Response},
    response::IntoResponse,
};

use crate::{
    adapters::{
        auth::{
            AuthHandler, AuthHandlerSettings, FlowFactory, Selector, is_internal_path,
        },
        upstream::{AppUpstream, UpstreamManager},
    },
    core::{AppConfig, AppId, AuthRule, ProxyError, RuleType},
    ports::Clock,
};

/// Everything an [`AppHandler`] build needs besides the app config.
#[derive(Clone)]
pub struct AppHandlerDeps {
    pub flows: Arc<dyn FlowFactory>,
    pub upstreams: Arc<UpstreamManager>,
    pub clock: Arc<dyn Clock>,
    pub auth: AuthHandlerSettings,
}

enum Route {
    Public(Arc<AppUpstream>),
    Provider(Arc<AuthHandler>),
    Selector(Selector),
}

struct RuleRoute {
    rule: AuthRule,
    route: Route,
}

pub struct AppHandler {
    app_id: AppId,
    upstream: Arc<AppUpstream>,
    internal: Option<Selector>,
    rules: Vec<RuleRoute>,
    trusted_prefix: String,
}

impl AppHandler {
    /// Builds the handler for one config. Fails closed on any rule that
    /// does not clearly say which providers protect it.
    pub async fn build(
        app_id: &AppId,
        config: &AppConfig,
        deps: &AppHandlerDeps,
    ) -> Result<Self, ProxyError> {
        validate_rules(app_id, config)?;

        let upstream = deps
            .upstreams
            .new_upstream(app_id, &config.upstream_app_url)?;
        match Self::assemble(app_id, config, deps, upstream.clone()).await {
            Ok(handler) => Ok(handler),
            Err(err) => {
                upstream.cancel();
                Err(err)
            }
        }
    }

    async fn assemble(
        app_id: &AppId,
        config: &AppConfig,
        deps: &AppHandlerDeps,
        upstream: Arc<AppUpstream>,
    ) -> Result<Self, ProxyError> {
        let app_name = if config.name.is_empty() {
            app_id.as_str()
        } else {
            config.name.as_str()
        };

        let mut providers: HashMap<&str, Arc<AuthHandler>> = HashMap::new();
        let mut ordered = Vec::with_capacity(config.auth_providers.len());
        for provider in &config.auth_providers {
            if providers.contains_key(provider.id()) {
                return Err(ProxyError::invalid_configuration(
                    app_id,
                    format!("duplicate provider id \"{}\"", provider.id()),
                ));
            }
            let options = provider.to_engine_options();
            let flow = deps.flows.create(&options).await.map_err(|err| {
                ProxyError::invalid_configuration(
                    app_id,
                    format!("unable to create provider \"{}\": {err}", provider.id()),
                )
            })?;
            let handler = Arc::new(AuthHandler::new(
                app_id,
                app_name,
                &options,
                flow,
                upstream.clone(),
                deps.clock.clone(),
                &deps.auth,
            ));
            providers.insert(provider.id(), handler.clone());
            ordered.push(handler);
        }

        let mut rules = Vec::with_capacity(config.auth_rules.len());
        for (index, rule) in config.auth_rules.iter().enumerate() {
            let mut handlers = Vec::with_capacity(rule.auth.len());
            for id in &rule.auth {
                let handler = providers.get(id.as_str()).ok_or_else(|| {
                    ProxyError::invalid_configuration(
                        app_id,
                        format!("rule {index} references unknown provider \"{id}\""),
                    )
                })?;
                handlers.push(handler.clone());
            }
            let route = match handlers.len() {
                0 => Route::Public(upstream.clone()),
                1 => Route::Provider(handlers.remove(0)),
                _ => Route::Selector(Selector::new(app_name, handlers)),
            };
            rules.push(RuleRoute {
                rule: rule.clone(),
                route,
            });
        }

        let internal = (!ordered.is_empty()).then(|| Selector::new(app_name, ordered));

        Ok(Self {
            app_id: app_id.clone(),
            upstream,
            internal,
            rules,
            trusted_prefix: deps.auth.headers.prefix.clone(),
        })
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    /// Cancels background work of the upstream this handler owns.
    pub fn cancel(&self) {
        self.upstream.cancel();
    }

    /// Serves one request; every error becomes an error page.
    pub async fn serve(&self, mut req: Request<Body>) -> Response<Body> {
        strip_trusted_headers(req.headers_mut(), &self.trusted_prefix);
        let path = req.uri().path().to_string();

        let result = if is_internal_path(&path) {
            match &self.internal {
                Some(selector) => selector.serve(req).await,
                None => Err(ProxyError::not_found(format!(
                    "Route \"{path}\" not found in app \"{}\".",
                    self.app_id
                ))),
            }
        } else {
            match self.rules.iter().find(|r| r.rule.matches(&path)) {
                Some(RuleRoute {
                    route: Route::Public(upstream),
                    ..
                }) => upstream.serve(req).await,
                Some(RuleRoute {
                    route: Route::Provider(handler),
                    ..
                }) => handler.serve(req, None).await,
                Some(RuleRoute {
                    route: Route::Selector(selector),
                    ..
                }) => selector.serve(req).await,
                None => Err(ProxyError::not_found(format!(
                    "Route \"{path}\" not found in app \"{}\".",
                    self.app_id
                ))),
            }
        };

        result.unwrap_or_else(|err| {
            if err.status().is_server_error() {
                tracing::warn!(app_id = %self.app_id, path = %path, error = %err, "Request failed");
            } else {
                tracing::debug!(app_id = %self.app_id, path = %path, error = %err, "Request rejected");
            }
            err.into_response()
        })
    }
}

/// Checks the rules before anything gets built.
fn validate_rules(app_id: &AppId, config: &AppConfig) -> Result<(), ProxyError> {
    if config.auth_rules.is_empty() {
        return Err(ProxyError::invalid_configuration(
            app_id,
            "no authorization rules defined",
        ));
    }
    for (index, rule) in config.auth_rules.iter().enumerate() {
        if rule.rule_type == RuleType::Unknown {
            return Err(ProxyError::invalid_configuration(
                app_id,
                format!("rule {index} has an unsupported type"),
            ));
        }
        match (rule.requires_auth(), rule.auth.is_empty()) {
            (false, false) => {
                return Err(ProxyError::invalid_configuration(
                    app_id,
                    format!("rule {index} has authRequired false but lists providers"),
                ));
            }
            (true, true) => {
                return Err(ProxyError::invalid_configuration(
                    app_id,
                    format!("rule {index} requires authentication but lists no providers"),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

/// Removes inbound headers that only the proxy may set.
fn strip_trusted_headers(headers: &mut HeaderMap, prefix: &str) {
    let spoofed: Vec<_> = headers
        .keys()
        .filter(|name| name.as_str().starts_with(prefix))
        .cloned()
        .collect();
    for name in spoofed {
        headers.remove(name);
    }
}
