//! Session and bearer credentials
//!
//! The manager never authenticates on its own; it asks a [`SessionProvider`]
//! whether a session exists and for the current access token. [`Session`] is
//! the in-process implementation: the host application hands it a token
//! after signing in and clears it on sign-out.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};

/// Supplies the session state the reporting loop depends on
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Succeeds if an authenticated session exists
    async fn resolve_session(&self) -> Result<()>;

    /// Current bearer token, if any
    fn access_token(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
struct Credential {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Claims {
    #[serde(default)]
    expires_at: Option<i64>,
}

/// Expiry from the `expiresAt` claim (seconds) of a JWT-shaped token
///
/// Opaque tokens and tokens without a positive `expiresAt` never expire.
fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Claims = serde_json::from_slice(&bytes).ok()?;
    match claims.expires_at {
        Some(secs) if secs > 0 => Utc.timestamp_opt(secs, 0).single(),
        _ => None,
    }
}

/// In-process session holding at most one access token
#[derive(Debug, Default)]
pub struct Session {
    credential: RwLock<Option<Credential>>,
}

impl Session {
    /// Session with no credentials
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let session = Self::new();
        session.set_token(Some(token.into()));
        session
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Credential>> {
        self.credential
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Credential>> {
        self.credential
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the held token; `None` or an empty string signs out
    pub fn set_token(&self, token: Option<String>) {
        let credential = token
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .map(|token| Credential {
                expires_at: token_expiry(&token),
                token,
            });

        if let Some(exp) = credential.as_ref().and_then(|c| c.expires_at) {
            tracing::debug!(expires_at = %exp, "Session token set");
        }
        *self.write() = credential;
    }

    pub fn clear(&self) {
        *self.write() = None;
    }

    /// Expiry of the held token, if it carries one
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.read().as_ref().and_then(|c| c.expires_at)
    }

    pub fn is_authenticated(&self) -> bool {
        self.token_at(Utc::now()).is_some()
    }

    fn token_at(&self, now: DateTime<Utc>) -> Option<String> {
        self.read()
            .as_ref()
            .filter(|c| !c.is_expired_at(now))
            .map(|c| c.token.clone())
    }
}

#[async_trait]
impl SessionProvider for Session {
    async fn resolve_session(&self) -> Result<()> {
        let expired = match self.read().as_ref() {
            None => return Err(Error::Unauthenticated),
            Some(credential) => credential.is_expired_at(Utc::now()),
        };

        if expired {
            tracing::info!("Session token expired, clearing session");
            self.clear();
            return Err(Error::Unauthenticated);
        }
        Ok(())
    }

    fn access_token(&self) -> Option<String> {
        self.token_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn jwt_with_claims(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.signature", header, payload)
    }

    #[tokio::test]
    async fn test_empty_session_is_unauthenticated() {
        let session = Session::new();
        assert!(matches!(
            session.resolve_session().await,
            Err(Error::Unauthenticated)
        ));
        assert!(session.access_token().is_none());
    }

    #[tokio::test]
    async fn test_opaque_token_never_expires() {
        let session = Session::with_token("opaque-token");
        assert!(session.resolve_session().await.is_ok());
        assert_eq!(session.access_token().as_deref(), Some("opaque-token"));
        assert!(session.expires_at().is_none());
    }

    #[tokio::test]
    async fn test_jwt_expiry_is_honored() {
        let future = (Utc::now() + Duration::hours(1)).timestamp();
        let session = Session::with_token(jwt_with_claims(serde_json::json!({
            "userID": "u1",
            "expiresAt": future
        })));
        assert_eq!(session.expires_at().map(|e| e.timestamp()), Some(future));
        assert!(session.resolve_session().await.is_ok());

        let past = (Utc::now() - Duration::minutes(5)).timestamp();
        session.set_token(Some(jwt_with_claims(serde_json::json!({"expiresAt": past}))));
        assert!(session.access_token().is_none());
        assert!(matches!(
            session.resolve_session().await,
            Err(Error::Unauthenticated)
        ));
        // Expired sessions are cleared on resolve
        assert!(session.expires_at().is_none());
    }

    #[test]
    fn test_zero_expiry_means_no_expiry() {
        let token = jwt_with_claims(serde_json::json!({"expiresAt": 0}));
        assert!(token_expiry(&token).is_none());
    }

    #[test]
    fn test_clear_and_blank_tokens_sign_out() {
        let session = Session::with_token("abc");
        assert!(session.is_authenticated());
        session.clear();
        assert!(!session.is_authenticated());

        session.set_token(Some("   ".to_string()));
        assert!(!session.is_authenticated());
    }
}
