//! Per-app authorization configuration as served by the control plane.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::provider::Provider;

/// Authorization configuration of one data app.
///
/// `etag` and `max_age` are revalidation metadata taken from the fetch
/// response headers; they never appear in the JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default, alias = "appId")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub upstream_app_url: String,
    #[serde(default)]
    pub auth_providers: Vec<Provider>,
    #[serde(default)]
    pub auth_rules: Vec<AuthRule>,
    #[serde(skip)]
    pub etag: Option<String>,
    #[serde(skip)]
    pub max_age: Duration,
}

impl AppConfig {
    pub fn provider(&self, id: &str) -> Option<&Provider> {
        self.auth_providers.iter().find(|p| p.id() == id)
    }
}

/// Rule kinds understood by the router. Unknown kinds decode fine and are
/// rejected when the app handler is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleType {
    #[serde(rename = "pathPrefix")]
    PathPrefix,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub value: String,
    /// Provider IDs allowed on this rule.
    #[serde(default)]
    pub auth: Vec<String>,
    /// `None` means required.
    #[serde(default)]
    pub auth_required: Option<bool>,
}

impl AuthRule {
    pub fn requires_auth(&self) -> bool {
        self.auth_required.unwrap_or(true)
    }

    pub fn matches(&self, path: &str) -> bool {
        match self.rule_type {
            RuleType::PathPrefix => path.starts_with(&self.value),
            RuleType::Unknown => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_app_config() {
        let config: AppConfig = serde_json::from_str(
            r#"{
                "name": "My App",
                "projectId": "456",
                "upstreamAppUrl": "http://app.local:8888",
                "authProviders": [{"id": "pwd", "type": "basic", "password": "x"}],
                "authRules": [
                    {"type": "pathPrefix", "value": "/api", "auth": ["pwd"]},
                    {"type": "pathPrefix", "value": "/", "authRequired": false},
                    {"type": "regex", "value": ".*"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.name, "My App");
        assert_eq!(config.project_id, "456");
        assert_eq!(config.etag, None);
        assert!(config.provider("pwd").is_some());
        assert!(config.provider("missing").is_none());

        assert!(config.auth_rules[0].requires_auth());
        assert!(!config.auth_rules[1].requires_auth());
        assert_eq!(config.auth_rules[2].rule_type, RuleType::Unknown);

        assert!(config.auth_rules[0].matches("/api/users"));
        assert!(!config.auth_rules[0].matches("/"));
        assert!(!config.auth_rules[2].matches("/anything"));
    }
}
