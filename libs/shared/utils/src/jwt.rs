use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;

use shared_models::auth::{JwtClaims, User};

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TokenError {
    #[error("JWT secret is not set")]
    SecretMissing,

    #[error("Invalid token format")]
    Malformed,

    #[error("Invalid signature encoding")]
    SignatureEncoding,

    #[error("Invalid token signature")]
    SignatureMismatch,

    #[error("Invalid claims")]
    Claims,

    #[error("Token expired")]
    Expired,
}

/// Validates an HS256 bearer token issued by the auth provider and returns
/// the caller it identifies.
pub fn validate_token(token: &str, jwt_secret: &str, now: DateTime<Utc>) -> Result<User, TokenError> {
    if jwt_secret.is_empty() {
        return Err(TokenError::SecretMissing);
    }

    let mut parts = token.split('.');
    let (header_b64, claims_b64, signature_b64) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(header), Some(claims), Some(signature), None) => (header, claims, signature),
        _ => return Err(TokenError::Malformed),
    };

    let signature = URL_SAFE_NO_PAD.decode(signature_b64).map_err(|e| {
        debug!("Failed to decode signature: {}", e);
        TokenError::SignatureEncoding
    })?;

    let mut mac = HmacSha256::new_from_slice(jwt_secret.as_bytes())
        .map_err(|_| TokenError::SecretMissing)?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(claims_b64.as_bytes());

    mac.verify_slice(&signature).map_err(|_| {
        debug!("Token signature verification failed");
        TokenError::SignatureMismatch
    })?;

    let claims_json = URL_SAFE_NO_PAD.decode(claims_b64).map_err(|_| TokenError::Claims)?;
    let claims: JwtClaims = serde_json::from_slice(&claims_json).map_err(|e| {
        debug!("Failed to parse claims: {}", e);
        TokenError::Claims
    })?;

    if let Some(exp) = claims.exp {
        if exp < now.timestamp() {
            debug!("Token expired at {} (now: {})", exp, now.timestamp());
            return Err(TokenError::Expired);
        }
    }

    let created_at = claims.iat.and_then(|iat| Utc.timestamp_opt(iat, 0).single());
    let role = claims.clinic_role();

    let user = User {
        id: claims.sub,
        email: claims.email,
        role,
        metadata: claims.user_metadata,
        created_at,
    };

    debug!("Token validated successfully for user: {}", user.id);
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{JwtTestUtils, TestUser};
    use assert_matches::assert_matches;

    const SECRET: &str = "unit-test-secret";

    #[test]
    fn accepts_token_signed_with_secret() {
        let user = TestUser::doctor("doc@example.com");
        let token = JwtTestUtils::create_test_token(&user, SECRET, Some(1));

        let validated = validate_token(&token, SECRET, Utc::now()).unwrap();
        assert_eq!(validated.id, user.id);
        assert_eq!(validated.role.as_deref(), Some("doctor"));
    }

    #[test]
    fn rejects_wrong_secret() {
        let user = TestUser::default();
        let token = JwtTestUtils::create_invalid_signature_token(&user);

        assert_matches!(validate_token(&token, SECRET, Utc::now()), Err(TokenError::SignatureMismatch));
    }

    #[test]
    fn rejects_expired_token() {
        let user = TestUser::default();
        let token = JwtTestUtils::create_expired_token(&user, SECRET);

        assert_matches!(validate_token(&token, SECRET, Utc::now()), Err(TokenError::Expired));
    }

    #[test]
    fn rejects_malformed_token_and_missing_secret() {
        assert_matches!(validate_token("a.b", SECRET, Utc::now()), Err(TokenError::Malformed));
        assert_matches!(validate_token("a.b.c", "", Utc::now()), Err(TokenError::SecretMissing));
    }
}
