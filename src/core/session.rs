//! State carried in the signed session and CSRF cookies.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An authenticated user, bound to one `(app, provider)` pair by the cookie
/// secret it is signed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Login in progress between the sign-in redirect and the callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingLogin {
    pub state: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub pkce_verifier: Option<String>,
    pub redirect_to: String,
}

/// Checks a role policy: `None` allows everyone, `Some(list)` requires at
/// least one shared role. An empty list therefore denies everyone.
pub fn roles_allowed(allowed: Option<&[String]>, roles: &[String]) -> bool {
    match allowed {
        None => true,
        Some(allowed) => roles.iter().any(|role| allowed.contains(role)),
    }
}

/// Keeps redirect targets on the same origin.
pub fn sanitize_redirect(target: &str) -> String {
    if target.starts_with('/') && !target.starts_with("//") && !target.starts_with("/\\") {
        target.to_string()
    } else {
        "/".to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn test_roles_policy() {
        let admin = vec!["admin".to_string()];
        let manager = vec!["manager".to_string()];

        assert!(roles_allowed(None, &manager));
        assert!(roles_allowed(Some(&admin), &admin));
        assert!(!roles_allowed(Some(&admin), &manager));
        // Present but empty denies everyone, including users without roles.
        assert!(!roles_allowed(Some(&[]), &admin));
        assert!(!roles_allowed(Some(&[]), &[]));
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now();
        let session = Session {
            user: "alice".into(),
            email: None,
            roles: vec![],
            expires_at: now + TimeDelta::minutes(1),
        };
        assert!(!session.is_expired(now));
        assert!(session.is_expired(now + TimeDelta::minutes(1)));
    }

    #[test]
    fn test_sanitize_redirect() {
        assert_eq!(sanitize_redirect("/some/data?x=1"), "/some/data?x=1");
        assert_eq!(sanitize_redirect("//evil.com"), "/");
        assert_eq!(sanitize_redirect("https://evil.com"), "/");
        assert_eq!(sanitize_redirect(""), "/");
    }
}
