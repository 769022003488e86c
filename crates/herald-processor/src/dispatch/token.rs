//! Signed one-time action tokens.
//!
//! Tokens have the form `<claims>.<signature>`, both base64url without
//! padding. The claims are JSON; the signature is HMAC-SHA256 over the
//! encoded claims.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use herald_core::{time::unix_seconds, Clock, SubjectId};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{ProcessorError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Issues the token embedded in an action link.
#[async_trait]
pub trait TokenIssuer: Send + Sync + fmt::Debug {
    /// Creates a token for the subject.
    async fn generate(&self, subject_id: SubjectId, subject_name: &str) -> Result<String>;
}

/// Claims carried by an issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issuer name.
    pub iss: String,
    /// Subject name.
    pub sub: String,
    /// Subject id.
    pub uid: i64,
    /// Issued at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// HMAC-SHA256 token issuer.
pub struct HmacTokenIssuer {
    secret: Vec<u8>,
    issuer: String,
    lifespan: Duration,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for HmacTokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HmacTokenIssuer")
            .field("issuer", &self.issuer)
            .field("lifespan", &self.lifespan)
            .finish_non_exhaustive()
    }
}

impl HmacTokenIssuer {
    /// Creates an issuer signing with `secret`.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError::Configuration` for an empty secret.
    pub fn new(
        secret: impl Into<Vec<u8>>,
        issuer: impl Into<String>,
        lifespan: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(ProcessorError::configuration("token secret must not be empty"));
        }
        Ok(Self { secret, issuer: issuer.into(), lifespan, clock })
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| ProcessorError::token_issue(format!("invalid signing key: {e}")))
    }

    /// Checks the signature and expiry of `token` and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns `ProcessorError::TokenIssue` for malformed, forged or expired
    /// tokens.
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| ProcessorError::token_issue("malformed token"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|e| ProcessorError::token_issue(format!("bad signature encoding: {e}")))?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| ProcessorError::token_issue("signature mismatch"))?;

        let claims: TokenClaims = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|e| ProcessorError::token_issue(format!("bad claims encoding: {e}")))
            .and_then(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| ProcessorError::token_issue(format!("bad claims: {e}")))
            })?;

        if claims.exp < unix_seconds(self.clock.now_system()) {
            return Err(ProcessorError::token_issue("token expired"));
        }
        Ok(claims)
    }
}

#[async_trait]
impl TokenIssuer for HmacTokenIssuer {
    async fn generate(&self, subject_id: SubjectId, subject_name: &str) -> Result<String> {
        let issued_at = unix_seconds(self.clock.now_system());
        let lifespan = i64::try_from(self.lifespan.as_secs()).unwrap_or(i64::MAX);
        let claims = TokenClaims {
            iss: self.issuer.clone(),
            sub: subject_name.to_string(),
            uid: subject_id.0,
            iat: issued_at,
            exp: issued_at.saturating_add(lifespan),
        };

        let json = serde_json::to_vec(&claims)
            .map_err(|e| ProcessorError::token_issue(format!("failed to encode claims: {e}")))?;
        let payload = URL_SAFE_NO_PAD.encode(json);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

        Ok(format!("{payload}.{signature}"))
    }
}

#[cfg(test)]
mod tests {
    use herald_core::TestClock;

    use super::*;

    fn issuer(clock: Arc<TestClock>) -> HmacTokenIssuer {
        HmacTokenIssuer::new("s3cret", "herald", Duration::from_secs(3600), clock).unwrap()
    }

    #[tokio::test]
    async fn generated_token_verifies() {
        let clock = Arc::new(TestClock::new());
        let issuer = issuer(clock);

        let token = issuer.generate(SubjectId(7), "alice@example.com").await.unwrap();
        let claims = issuer.verify(&token).unwrap();

        assert_eq!(claims.sub, "alice@example.com");
        assert_eq!(claims.uid, 7);
        assert_eq!(claims.iss, "herald");
        assert_eq!(claims.exp - claims.iat, 3600);
    }

    #[tokio::test]
    async fn tampered_token_is_rejected() {
        let issuer = issuer(Arc::new(TestClock::new()));
        let token = issuer.generate(SubjectId(7), "alice@example.com").await.unwrap();
        let (_, signature) = token.split_once('.').unwrap();

        let forged_claims = URL_SAFE_NO_PAD.encode(
            br#"{"iss":"herald","sub":"mallory@example.com","uid":8,"iat":0,"exp":9999999999}"#,
        );
        let forged = format!("{forged_claims}.{signature}");

        assert!(issuer.verify(&forged).is_err());
        assert!(issuer.verify("no-dot").is_err());
    }

    #[tokio::test]
    async fn token_expires_after_lifespan() {
        let clock = Arc::new(TestClock::new());
        let issuer = issuer(clock.clone());
        let token = issuer.generate(SubjectId(1), "bob@example.com").await.unwrap();

        clock.advance(Duration::from_secs(3601));

        assert!(issuer.verify(&token).is_err());
    }

    #[test]
    fn empty_secret_is_rejected() {
        let result =
            HmacTokenIssuer::new("", "herald", Duration::from_secs(1), Arc::new(TestClock::new()));
        assert!(matches!(result, Err(ProcessorError::Configuration { .. })));
    }
}
