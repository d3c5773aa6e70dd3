use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

/// Who a bearer credential resolves to. Everything downstream of the
/// management surface works in terms of this; credential issuance and
/// account storage live upstream.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub secret: String,
    /// Accept unsigned/expired tokens and trust their payload. Local
    /// development only.
    pub bypass: bool,
}

#[derive(Clone)]
pub struct AuthContext {
    decoding: DecodingKey,
    bypass: bool,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("token validation failed: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("token missing subject")]
    MissingSubject,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

impl AuthContext {
    pub fn new(config: AuthConfig) -> Self {
        Self {
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            bypass: config.bypass,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        if self.bypass {
            validation.insecure_disable_signature_validation();
            validation.validate_exp = false;
            validation.required_spec_claims = Default::default();
        }

        let data = decode::<Claims>(token, &self.decoding, &validation)?;
        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthError::MissingSubject);
        }

        Ok(Identity {
            user_id: claims.sub,
            email: claims
                .email
                .map(|email| email.trim().to_lowercase())
                .unwrap_or_default(),
        })
    }
}

#[cfg(test)]
pub(crate) fn mint_token(secret: &str, user_id: &str, email: &str) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        email: &'a str,
        exp: i64,
    }

    encode(
        &Header::default(),
        &TestClaims {
            sub: user_id,
            email,
            exp: chrono::Utc::now().timestamp() + 3_600,
        },
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("token encoding")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_signed_token_and_folds_email() {
        let ctx = AuthContext::new(AuthConfig {
            secret: "s3cret".into(),
            bypass: false,
        });
        let token = mint_token("s3cret", "user-1", "Alice@Example.COM");
        let identity = ctx.verify(&token).unwrap();
        assert_eq!(identity.user_id, "user-1");
        assert_eq!(identity.email, "alice@example.com");
    }

    #[test]
    fn rejects_wrong_secret() {
        let ctx = AuthContext::new(AuthConfig {
            secret: "right".into(),
            bypass: false,
        });
        let token = mint_token("wrong", "user-1", "a@b.c");
        assert!(matches!(ctx.verify(&token), Err(AuthError::Jwt(_))));
    }

    #[test]
    fn bypass_accepts_unverified_payload() {
        let ctx = AuthContext::new(AuthConfig {
            secret: "anything".into(),
            bypass: true,
        });
        let token = mint_token("some-other-secret", "user-2", "b@c.d");
        let identity = ctx.verify(&token).unwrap();
        assert_eq!(identity.user_id, "user-2");
    }

    #[test]
    fn empty_token_is_missing() {
        let ctx = AuthContext::new(AuthConfig {
            secret: "s".into(),
            bypass: false,
        });
        assert!(matches!(ctx.verify(""), Err(AuthError::MissingToken)));
    }
}
