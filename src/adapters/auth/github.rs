//! GitHub OAuth flow with organization, team, repository and user
//! allow-lists checked through the GitHub REST API.
use async_trait::async_trait;
use axum::{body::Body, http::Request};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, Scope,
    TokenResponse, TokenUrl, basic::BasicClient,
};
use reqwest::{StatusCode, header};
use serde::{Deserialize, de::DeserializeOwned};

use super::{
    flow::{AuthError, CallbackContext, Identity, IdentityFlow, LoginAction, LoginStart, check_state},
    oidc::CallbackParams,
};
use crate::core::{PendingLogin, provider::GitHubEngineOptions};

#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    verified: bool,
}

#[derive(Debug, Deserialize)]
struct GitHubOrg {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GitHubTeam {
    slug: String,
    organization: GitHubOrg,
}

pub struct GitHubFlow {
    options: GitHubEngineOptions,
    auth_url: AuthUrl,
    token_url: TokenUrl,
    http: reqwest::Client,
}

impl GitHubFlow {
    pub fn new(options: GitHubEngineOptions, http: reqwest::Client) -> Result<Self, AuthError> {
        if options.client_id.is_empty() {
            return Err(AuthError::Configuration("missing client ID".to_string()));
        }
        let auth_url = AuthUrl::new(options.login_url.clone())
            .map_err(|e| AuthError::Configuration(format!("invalid login URL: {e}")))?;
        let token_url = TokenUrl::new(options.token_url.clone())
            .map_err(|e| AuthError::Configuration(format!("invalid token URL: {e}")))?;
        Ok(Self {
            options,
            auth_url,
            token_url,
            http,
        })
    }

    async fn api_get<T: DeserializeOwned>(&self, path: &str, token: &str) -> Result<T, AuthError> {
        let response = self
            .api_request(path, token)
            .await?
            .error_for_status()
            .map_err(|e| AuthError::Provider(format!("GitHub API error: {e}")))?;
        response
            .json::<T>()
            .await
            .map_err(|e| AuthError::Provider(format!("invalid GitHub API response: {e}")))
    }

    async fn api_request(&self, path: &str, token: &str) -> Result<reqwest::Response, AuthError> {
        self.http
            .get(format!("{}{path}", self.options.api_url.trim_end_matches('/')))
            .bearer_auth(token)
            .header(header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| AuthError::Provider(format!("GitHub API request failed: {e}")))
    }

    async fn primary_email(&self, token: &str) -> Result<Option<String>, AuthError> {
        let emails: Vec<GitHubEmail> = self.api_get("/user/emails?per_page=100", token).await?;
        Ok(emails
            .into_iter()
            .find(|e| e.primary && e.verified)
            .map(|e| e.email))
    }

    /// Organizations and `org:team` pairs of the user.
    async fn memberships(&self, token: &str) -> Result<Vec<String>, AuthError> {
        let orgs: Vec<GitHubOrg> = self.api_get("/user/orgs?per_page=100", token).await?;
        let teams: Vec<GitHubTeam> = self.api_get("/user/teams?per_page=100", token).await?;

        let mut roles: Vec<String> = orgs.into_iter().map(|org| org.login).collect();
        roles.extend(
            teams
                .into_iter()
                .map(|team| format!("{}:{}", team.organization.login, team.slug)),
        );
        Ok(roles)
    }

    async fn is_collaborator(&self, repository: &str, login: &str, token: &str) -> Result<bool, AuthError> {
        let response = self
            .api_request(&format!("/repos/{repository}/collaborators/{login}"), token)
            .await?;
        Ok(response.status() == StatusCode::NO_CONTENT)
    }

    fn org_team_allowed(&self, roles: &[String]) -> bool {
        let has = |role: &str| roles.iter().any(|r| r.eq_ignore_ascii_case(role));
        match (&self.options.organization, &self.options.team) {
            (None, None) => true,
            (Some(org), None) => has(org),
            (org, Some(team)) => team.split(',').map(str::trim).any(|team| {
                if team.contains(':') {
                    has(team)
                } else {
                    org.as_deref().is_some_and(|org| has(&format!("{org}:{team}")))
                }
            }),
        }
    }
}

#[async_trait]
impl IdentityFlow for GitHubFlow {
    async fn begin(&self, redirect_uri: &str, redirect_to: &str) -> Result<LoginStart, AuthError> {
        let redirect_url = RedirectUrl::new(redirect_uri.to_string())
            .map_err(|e| AuthError::Configuration(format!("invalid redirect URI: {e}")))?;
        let client = BasicClient::new(ClientId::new(self.options.client_id.clone()))
            .set_auth_uri(self.auth_url.clone())
            .set_redirect_uri(redirect_url);

        let mut request = client.authorize_url(CsrfToken::new_random);
        for scope in &self.options.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (url, csrf) = request.url();

        Ok(LoginStart {
            action: LoginAction::Redirect(url.to_string()),
            pending: PendingLogin {
                state: csrf.secret().clone(),
                nonce: None,
                pkce_verifier: None,
                redirect_to: redirect_to.to_string(),
            },
        })
    }

    async fn complete(&self, req: Request<Body>, ctx: CallbackContext) -> Result<Identity, AuthError> {
        let params = CallbackParams::from_request(&req);
        if let Some(error) = params.error {
            return Err(AuthError::Unauthorized(format!("login failed: {error}")));
        }
        check_state(params.state.as_deref(), &ctx.pending)?;
        let code = params
            .code
            .ok_or_else(|| AuthError::BadRequest("missing authorization code".to_string()))?;

        let redirect_url = RedirectUrl::new(ctx.redirect_uri.clone())
            .map_err(|e| AuthError::Configuration(format!("invalid redirect URI: {e}")))?;
        let client = BasicClient::new(ClientId::new(self.options.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.options.client_secret.clone()))
            .set_token_uri(self.token_url.clone())
            .set_redirect_uri(redirect_url);
        let token_response = client
            .exchange_code(AuthorizationCode::new(code))
            .request_async(&self.http)
            .await
            .map_err(|e| AuthError::Provider(format!("token exchange failed: {e}")))?;
        let token = token_response.access_token().secret().clone();

        let user: GitHubUser = self.api_get("/user", &token).await?;
        let email = match user.email {
            Some(email) => Some(email),
            None => self.primary_email(&token).await?,
        };
        let roles = self.memberships(&token).await?;

        let listed = self
            .options
            .users
            .iter()
            .any(|u| u.eq_ignore_ascii_case(&user.login));
        if !listed {
            if !self.org_team_allowed(&roles) {
                return Err(AuthError::Forbidden(
                    "user is not a member of the allowed organization or team".to_string(),
                ));
            }
            if let Some(repository) = &self.options.repository
                && !self.is_collaborator(repository, &user.login, &token).await?
            {
                return Err(AuthError::Forbidden(format!(
                    "user is not a collaborator of repository \"{repository}\""
                )));
            }
            if self.options.organization.is_none()
                && self.options.team.is_none()
                && self.options.repository.is_none()
                && !self.options.users.is_empty()
            {
                return Err(AuthError::Forbidden("user is not allowed".to_string()));
            }
        }

        Ok(Identity {
            user: user.login,
            email,
            roles,
            access_token: Some(token),
        })
    }

    fn logout_url(&self) -> Option<&str> {
        self.options.logout_url.as_deref()
    }
}
