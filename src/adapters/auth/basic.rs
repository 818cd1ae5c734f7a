//! Shared-password login.
use async_trait::async_trait;
use axum::{
    body::{Body, to_bytes},
    http::Request,
};
use sha2::{Digest, Sha256};

use super::flow::{
    AuthError, CallbackContext, Identity, IdentityFlow, LoginAction, LoginStart, check_state,
    random_token,
};
use crate::core::{PendingLogin, provider::BasicEngineOptions};

const MAX_FORM_BYTES: usize = 16 * 1024;
const BASIC_USER: &str = "basic";

pub struct BasicFlow {
    password_digest: [u8; 32],
}

impl BasicFlow {
    pub fn new(options: &BasicEngineOptions) -> Result<Self, AuthError> {
        if options.password.is_empty() {
            return Err(AuthError::Configuration("password must not be empty".to_string()));
        }
        Ok(Self {
            password_digest: Sha256::digest(options.password.as_bytes()).into(),
        })
    }

    fn password_matches(&self, candidate: &str) -> bool {
        let digest: [u8; 32] = Sha256::digest(candidate.as_bytes()).into();
        digest
            .iter()
            .zip(self.password_digest.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

#[async_trait]
impl IdentityFlow for BasicFlow {
    async fn begin(&self, _redirect_uri: &str, redirect_to: &str) -> Result<LoginStart, AuthError> {
        Ok(LoginStart {
            action: LoginAction::PasswordForm,
            pending: PendingLogin {
                state: random_token(),
                nonce: None,
                pkce_verifier: None,
                redirect_to: redirect_to.to_string(),
            },
        })
    }

    async fn complete(&self, req: Request<Body>, ctx: CallbackContext) -> Result<Identity, AuthError> {
        let body = to_bytes(req.into_body(), MAX_FORM_BYTES)
            .await
            .map_err(|e| AuthError::BadRequest(format!("invalid login form: {e}")))?;

        let mut state = None;
        let mut password = None;
        for (key, value) in url::form_urlencoded::parse(&body) {
            match key.as_ref() {
                "state" => state = Some(value.into_owned()),
                "password" => password = Some(value.into_owned()),
                _ => {}
            }
        }
        check_state(state.as_deref(), &ctx.pending)?;

        match password {
            Some(password) if self.password_matches(&password) => Ok(Identity {
                user: BASIC_USER.to_string(),
                email: None,
                roles: Vec::new(),
                access_token: None,
            }),
            _ => Err(AuthError::Unauthorized("invalid password".to_string())),
        }
    }
}
