//! Authentication provider model.
//!
//! Providers arrive from the control plane as a JSON list tagged by `type`.
//! They decode into the closed [`Provider`] enum; adding a provider type means
//! adding a variant here and a match arm in [`Provider::to_engine_options`].
use std::fmt;

use serde::{Deserialize, Serialize};

pub const TYPE_OIDC: &str = "oidc";
pub const TYPE_GITHUB: &str = "github";
pub const TYPE_GITLAB: &str = "gitlab";
pub const TYPE_JUMPCLOUD: &str = "jumpcloud";
pub const TYPE_BASIC: &str = "basic";

const GITHUB_DEFAULT_URL: &str = "https://github.com";
const GITLAB_DEFAULT_ISSUER: &str = "https://gitlab.com";
const JUMPCLOUD_DEFAULT_ISSUER: &str = "https://oauth.id.jumpcloud.com/";
const DEFAULT_ROLES_CLAIM: &str = "groups";

/// One configured authentication provider of an app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Provider {
    #[serde(rename = "oidc")]
    Oidc(OidcProvider),
    #[serde(rename = "github")]
    GitHub(GitHubProvider),
    #[serde(rename = "gitlab")]
    GitLab(GitLabProvider),
    #[serde(rename = "jumpcloud")]
    JumpCloud(JumpCloudProvider),
    #[serde(rename = "basic")]
    Basic(BasicProvider),
}

/// Fields shared by every provider variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderBase {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// OpenID Connect client settings, shared by OIDC and its specializations.
///
/// `allowed_roles` keeps the difference between absent and empty:
/// `None` skips the role check, `Some(vec![])` denies everyone.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcSettings {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub issuer_url: String,
    #[serde(default)]
    pub logout_url: Option<String>,
    #[serde(default)]
    pub allowed_roles: Option<Vec<String>>,
}

impl fmt::Debug for OidcSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcSettings")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("issuer_url", &self.issuer_url)
            .field("logout_url", &self.logout_url)
            .field("allowed_roles", &self.allowed_roles)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcProvider {
    #[serde(flatten)]
    pub base: ProviderBase,
    #[serde(flatten)]
    pub oidc: OidcSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitHubProvider {
    #[serde(flatten)]
    pub base: ProviderBase,
    #[serde(flatten)]
    pub oidc: OidcSettings,
    /// Restrict to members of this organization.
    #[serde(default)]
    pub organization: Option<String>,
    /// Restrict to members of this team (`team` or `org:team`).
    #[serde(default)]
    pub team: Option<String>,
    /// Restrict to collaborators of this repository (`owner/repo`).
    #[serde(default)]
    pub repository: Option<String>,
    /// Restrict to these GitHub logins.
    #[serde(default)]
    pub users: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitLabProvider {
    #[serde(flatten)]
    pub base: ProviderBase,
    #[serde(flatten)]
    pub oidc: OidcSettings,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub projects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JumpCloudProvider {
    #[serde(flatten)]
    pub base: ProviderBase,
    #[serde(flatten)]
    pub oidc: OidcSettings,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicProvider {
    #[serde(flatten)]
    pub base: ProviderBase,
    pub password: String,
}

impl fmt::Debug for BasicProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicProvider")
            .field("base", &self.base)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything an identity engine needs to serve one provider.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    pub provider_id: String,
    pub provider_name: String,
    /// Role policy applied after login and on every request.
    pub allowed_roles: Option<Vec<String>>,
    pub kind: EngineKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineKind {
    Oidc(OidcEngineOptions),
    GitHub(GitHubEngineOptions),
    Basic(BasicEngineOptions),
}

#[derive(Clone, PartialEq)]
pub struct OidcEngineOptions {
    pub client_id: String,
    pub client_secret: String,
    pub issuer_url: String,
    pub scopes: Vec<String>,
    /// ID-token claim holding the user's roles/groups.
    pub roles_claim: String,
    /// Extra query parameters on the authorization URL.
    pub login_params: Vec<(String, String)>,
    pub logout_url: Option<String>,
    /// Groups the user must share at least one of (empty = no restriction).
    pub allowed_groups: Vec<String>,
    pub project_check: Option<ProjectCheck>,
}

impl fmt::Debug for OidcEngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OidcEngineOptions")
            .field("client_id", &self.client_id)
            .field("issuer_url", &self.issuer_url)
            .field("scopes", &self.scopes)
            .field("roles_claim", &self.roles_claim)
            .field("login_params", &self.login_params)
            .field("logout_url", &self.logout_url)
            .field("allowed_groups", &self.allowed_groups)
            .field("project_check", &self.project_check)
            .finish_non_exhaustive()
    }
}

/// GitLab project membership check performed with the user's access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectCheck {
    pub api_url: String,
    pub projects: Vec<String>,
}

#[derive(Clone, PartialEq)]
pub struct GitHubEngineOptions {
    pub client_id: String,
    pub client_secret: String,
    pub login_url: String,
    pub token_url: String,
    pub api_url: String,
    pub scopes: Vec<String>,
    pub organization: Option<String>,
    pub team: Option<String>,
    pub repository: Option<String>,
    pub users: Vec<String>,
    pub logout_url: Option<String>,
}

impl fmt::Debug for GitHubEngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GitHubEngineOptions")
            .field("client_id", &self.client_id)
            .field("login_url", &self.login_url)
            .field("api_url", &self.api_url)
            .field("organization", &self.organization)
            .field("team", &self.team)
            .field("repository", &self.repository)
            .field("users", &self.users)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BasicEngineOptions {
    pub password: String,
}

impl fmt::Debug for BasicEngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BasicEngineOptions { password: <redacted> }")
    }
}

impl Provider {
    fn base(&self) -> &ProviderBase {
        match self {
            Provider::Oidc(p) => &p.base,
            Provider::GitHub(p) => &p.base,
            Provider::GitLab(p) => &p.base,
            Provider::JumpCloud(p) => &p.base,
            Provider::Basic(p) => &p.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }

    /// Display name; falls back to the ID.
    pub fn name(&self) -> &str {
        let base = self.base();
        if base.name.is_empty() {
            &base.id
        } else {
            &base.name
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Provider::Oidc(_) => TYPE_OIDC,
            Provider::GitHub(_) => TYPE_GITHUB,
            Provider::GitLab(_) => TYPE_GITLAB,
            Provider::JumpCloud(_) => TYPE_JUMPCLOUD,
            Provider::Basic(_) => TYPE_BASIC,
        }
    }

    pub fn to_engine_options(&self) -> EngineOptions {
        let (allowed_roles, kind) = match self {
            Provider::Oidc(p) => (
                p.oidc.allowed_roles.clone(),
                EngineKind::Oidc(oidc_options(
                    &p.oidc,
                    &p.oidc.issuer_url,
                    vec![("prompt".to_string(), "select_account".to_string())],
                )),
            ),
            Provider::GitLab(p) => {
                let issuer = non_empty_or(&p.oidc.issuer_url, GITLAB_DEFAULT_ISSUER);
                let mut options = oidc_options(
                    &p.oidc,
                    &issuer,
                    vec![("prompt".to_string(), "login".to_string())],
                );
                options.allowed_groups = p.groups.clone();
                if !p.projects.is_empty() {
                    options.scopes.push("read_api".to_string());
                    options.project_check = Some(ProjectCheck {
                        api_url: format!("{}/api/v4", issuer.trim_end_matches('/')),
                        projects: p.projects.clone(),
                    });
                }
                (p.oidc.allowed_roles.clone(), EngineKind::Oidc(options))
            }
            Provider::JumpCloud(p) => {
                let issuer = non_empty_or(&p.oidc.issuer_url, JUMPCLOUD_DEFAULT_ISSUER);
                (
                    p.oidc.allowed_roles.clone(),
                    EngineKind::Oidc(oidc_options(
                        &p.oidc,
                        &issuer,
                        vec![("prompt".to_string(), "login".to_string())],
                    )),
                )
            }
            Provider::GitHub(p) => {
                let base = non_empty_or(&p.oidc.issuer_url, GITHUB_DEFAULT_URL);
                let base = base.trim_end_matches('/');
                let api_url = if base == GITHUB_DEFAULT_URL {
                    "https://api.github.com".to_string()
                } else {
                    format!("{base}/api/v3")
                };
                let mut scopes = vec!["user:email".to_string(), "read:org".to_string()];
                if p.repository.is_some() {
                    scopes.push("repo".to_string());
                }
                (
                    p.oidc.allowed_roles.clone(),
                    EngineKind::GitHub(GitHubEngineOptions {
                        client_id: p.oidc.client_id.clone(),
                        client_secret: p.oidc.client_secret.clone(),
                        login_url: format!("{base}/login/oauth/authorize"),
                        token_url: format!("{base}/login/oauth/access_token"),
                        api_url,
                        scopes,
                        organization: p.organization.clone(),
                        team: p.team.clone(),
                        repository: p.repository.clone(),
                        users: p.users.clone(),
                        logout_url: p.oidc.logout_url.clone(),
                    }),
                )
            }
            Provider::Basic(p) => (
                None,
                EngineKind::Basic(BasicEngineOptions {
                    password: p.password.clone(),
                }),
            ),
        };

        EngineOptions {
            provider_id: self.id().to_string(),
            provider_name: self.name().to_string(),
            allowed_roles,
            kind,
        }
    }
}

fn oidc_options(
    settings: &OidcSettings,
    issuer_url: &str,
    login_params: Vec<(String, String)>,
) -> OidcEngineOptions {
    OidcEngineOptions {
        client_id: settings.client_id.clone(),
        client_secret: settings.client_secret.clone(),
        issuer_url: issuer_url.to_string(),
        scopes: vec![
            "openid".to_string(),
            "email".to_string(),
            "profile".to_string(),
        ],
        roles_claim: DEFAULT_ROLES_CLAIM.to_string(),
        login_params,
        logout_url: settings.logout_url.clone(),
        allowed_groups: Vec::new(),
        project_check: None,
    }
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}
