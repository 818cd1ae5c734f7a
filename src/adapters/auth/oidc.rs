//! OpenID Connect flow (generic OIDC, GitLab, JumpCloud).
//!
//! Authorization code flow with PKCE and nonce. Provider metadata is
//! discovered once, when the app handler is built.
use async_trait::async_trait;
use axum::{body::Body, http::Request};
use base64::Engine as _;
use openidconnect::{
    AuthorizationCode, ClientId, ClientSecret, CsrfToken, IssuerUrl, Nonce, OAuth2TokenResponse,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, Scope, TokenResponse,
    core::{CoreAuthenticationFlow, CoreClient, CoreProviderMetadata},
};

use super::flow::{
    AuthError, CallbackContext, Identity, IdentityFlow, LoginAction, LoginStart, check_state,
};
use crate::core::{PendingLogin, provider::OidcEngineOptions};

pub struct OidcFlow {
    metadata: CoreProviderMetadata,
    options: OidcEngineOptions,
    http: reqwest::Client,
}

impl OidcFlow {
    pub async fn discover(options: OidcEngineOptions, http: reqwest::Client) -> Result<Self, AuthError> {
        if options.client_id.is_empty() {
            return Err(AuthError::Configuration("missing client ID".to_string()));
        }
        let issuer_url = IssuerUrl::new(options.issuer_url.clone())
            .map_err(|e| AuthError::Configuration(format!("invalid issuer URL: {e}")))?;

        let metadata = CoreProviderMetadata::discover_async(issuer_url, &http)
            .await
            .map_err(|e| AuthError::Configuration(format!("failed to discover provider: {e}")))?;

        Ok(Self {
            metadata,
            options,
            http,
        })
    }

    fn redirect_url(redirect_uri: &str) -> Result<RedirectUrl, AuthError> {
        RedirectUrl::new(redirect_uri.to_string())
            .map_err(|e| AuthError::Configuration(format!("invalid redirect URI: {e}")))
    }

    async fn check_membership(&self, roles: &[String], access_token: &str) -> Result<(), AuthError> {
        let groups = &self.options.allowed_groups;
        let projects = self
            .options
            .project_check
            .as_ref()
            .filter(|check| !check.projects.is_empty());

        if groups.is_empty() && projects.is_none() {
            return Ok(());
        }
        if roles.iter().any(|role| groups.contains(role)) {
            return Ok(());
        }
        if let Some(check) = projects {
            for project in &check.projects {
                let url = format!("{}/projects/{}", check.api_url, urlencoding::encode(project));
                let response = self
                    .http
                    .get(&url)
                    .bearer_auth(access_token)
                    .send()
                    .await
                    .map_err(|e| AuthError::Provider(format!("project membership check failed: {e}")))?;
                if response.status().is_success() {
                    return Ok(());
                }
            }
        }
        Err(AuthError::Forbidden(
            "user is not a member of any allowed group or project".to_string(),
        ))
    }
}

#[async_trait]
impl IdentityFlow for OidcFlow {
    async fn begin(&self, redirect_uri: &str, redirect_to: &str) -> Result<LoginStart, AuthError> {
        let client = CoreClient::from_provider_metadata(
            self.metadata.clone(),
            ClientId::new(self.options.client_id.clone()),
            Some(ClientSecret::new(self.options.client_secret.clone())),
        )
        .set_redirect_uri(Self::redirect_url(redirect_uri)?);
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut request = client
            .authorize_url(
                CoreAuthenticationFlow::AuthorizationCode,
                CsrfToken::new_random,
                Nonce::new_random,
            )
            .set_pkce_challenge(pkce_challenge);
        for scope in self.options.scopes.iter().filter(|s| s.as_str() != "openid") {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        for (name, value) in &self.options.login_params {
            request = request.add_extra_param(name.clone(), value.clone());
        }
        let (url, csrf, nonce) = request.url();

        Ok(LoginStart {
            action: LoginAction::Redirect(url.to_string()),
            pending: PendingLogin {
                state: csrf.secret().clone(),
                nonce: Some(nonce.secret().clone()),
                pkce_verifier: Some(pkce_verifier.secret().clone()),
                redirect_to: redirect_to.to_string(),
            },
        })
    }

    async fn complete(&self, req: Request<Body>, ctx: CallbackContext) -> Result<Identity, AuthError> {
        let params = CallbackParams::from_request(&req);
        if let Some(error) = params.error {
            let description = params.error_description.unwrap_or_default();
            return Err(AuthError::Unauthorized(
                format!("login failed: {error} {description}").trim().to_string(),
            ));
        }
        check_state(params.state.as_deref(), &ctx.pending)?;
        let code = params
            .code
            .ok_or_else(|| AuthError::BadRequest("missing authorization code".to_string()))?;

        let client = CoreClient::from_provider_metadata(
            self.metadata.clone(),
            ClientId::new(self.options.client_id.clone()),
            Some(ClientSecret::new(self.options.client_secret.clone())),
        )
        .set_redirect_uri(Self::redirect_url(&ctx.redirect_uri)?);
        let mut token_request = client
            .exchange_code(AuthorizationCode::new(code))
            .map_err(|e| AuthError::Provider(format!("token endpoint error: {e}")))?;
        if let Some(verifier) = &ctx.pending.pkce_verifier {
            token_request = token_request.set_pkce_verifier(PkceCodeVerifier::new(verifier.clone()));
        }
        let token_response = token_request
            .request_async(&self.http)
            .await
            .map_err(|e| AuthError::Provider(format!("token exchange failed: {e}")))?;

        let id_token = token_response
            .id_token()
            .ok_or_else(|| AuthError::Provider("no ID token in response".to_string()))?;
        let nonce = Nonce::new(ctx.pending.nonce.clone().unwrap_or_default());
        let claims = id_token
            .claims(&client.id_token_verifier(), &nonce)
            .map_err(|e| AuthError::Unauthorized(format!("ID token validation failed: {e}")))?;

        if claims.email_verified() == Some(false) {
            return Err(AuthError::Forbidden("email not verified".to_string()));
        }

        let email = claims.email().map(|e| e.as_str().to_string());
        let user = claims
            .preferred_username()
            .map(|u| u.as_str().to_string())
            .or_else(|| email.clone())
            .unwrap_or_else(|| claims.subject().as_str().to_string());

        let raw = serde_json::to_value(&token_response)
            .map_err(|e| AuthError::Provider(format!("failed to read token response: {e}")))?;
        let roles = raw
            .get("id_token")
            .and_then(|v| v.as_str())
            .map(|jwt| claim_strings(jwt, &self.options.roles_claim))
            .transpose()?
            .unwrap_or_default();

        let access_token = token_response.access_token().secret().clone();
        self.check_membership(&roles, &access_token).await?;

        Ok(Identity {
            user,
            email,
            roles,
            access_token: Some(access_token),
        })
    }

    fn logout_url(&self) -> Option<&str> {
        self.options.logout_url.as_deref()
    }
}

/// Query parameters of an OAuth2 callback.
#[derive(Debug, Default)]
pub(crate) struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    pub(crate) fn from_request(req: &Request<Body>) -> Self {
        let mut params = Self::default();
        let Some(query) = req.uri().query() else {
            return params;
        };
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "code" => params.code = value,
                "state" => params.state = value,
                "error" => params.error = value,
                "error_description" => params.error_description = value,
                _ => {}
            }
        }
        params
    }
}

/// Reads a string-array claim from the (already verified) JWT payload.
fn claim_strings(jwt: &str, claim: &str) -> Result<Vec<String>, AuthError> {
    let payload = jwt
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::Provider("invalid JWT format".to_string()))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| AuthError::Provider(format!("failed to decode JWT payload: {e}")))?;
    let payload: serde_json::Value = serde_json::from_slice(&bytes)
        .map_err(|e| AuthError::Provider(format!("failed to parse JWT payload: {e}")))?;

    Ok(match payload.get(claim) {
        Some(serde_json::Value::Array(values)) => values
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(serde_json::Value::String(value)) => vec![value.clone()],
        _ => Vec::new(),
    })
}
