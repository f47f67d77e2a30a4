use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::{
    config::AuthConfig,
    error::{Error, TokenErrorKind},
    permissions::Permissions,
    utils::id::{optional_string_or_number, string_or_number, u64_from_string_or_number},
};

/// Claims carried by a voice join token.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinClaims {
    #[serde(deserialize_with = "string_or_number")]
    pub sub: String,
    #[serde(default)]
    pub typ: String,
    pub iss: String,
    pub exp: u64,
    #[serde(default)]
    pub iat: Option<u64>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub channel_id: Option<String>,
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub guild_id: Option<String>,
    #[serde(default, deserialize_with = "u64_from_string_or_number")]
    pub permissions: u64,
    #[serde(default)]
    pub moved: bool,
}

/// What a validated token allows the bearer to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinGrant {
    pub user_id: String,
    /// `None` when the token is not bound to a channel.
    pub channel_id: Option<String>,
    pub guild_id: Option<String>,
    pub permissions: Permissions,
    pub moved: bool,
}

#[derive(Clone)]
pub struct TokenValidator {
    key: DecodingKey,
    validation: Validation,
    token_type: String,
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("validation", &self.validation)
            .field("token_type", &self.token_type)
            .finish()
    }
}

impl TokenValidator {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        // `sub` may be numeric, `JoinClaims` requires it instead.
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        validation.leeway = config.leeway_secs;

        Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            token_type: config.token_type.clone(),
        }
    }

    /// Verifies `bearer` (with or without a `Bearer ` prefix) and returns the grant it carries.
    /// Only HS256 is accepted.
    pub fn validate(&self, bearer: &str) -> Result<JoinGrant, Error> {
        let token = bearer.trim();
        let token = token.strip_prefix("Bearer ").unwrap_or(token).trim();
        if token.is_empty() {
            return Err(Error::new_token(
                "empty token".to_string(),
                TokenErrorKind::Malformed,
            ));
        }

        let data = decode::<JoinClaims>(token, &self.key, &self.validation)?;
        let claims = data.claims;

        if claims.typ != self.token_type {
            return Err(Error::new_token(
                format!("unexpected token type {:?}", claims.typ),
                TokenErrorKind::InvalidTokenType,
            ));
        }
        if claims.sub.is_empty() {
            return Err(Error::new_token(
                "empty subject".to_string(),
                TokenErrorKind::Malformed,
            ));
        }

        Ok(JoinGrant {
            user_id: claims.sub,
            channel_id: claims.channel_id,
            guild_id: claims.guild_id,
            permissions: Permissions::for_join(claims.permissions, claims.moved),
            moved: claims.moved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &str = "test-secret";

    fn auth_config() -> AuthConfig {
        AuthConfig {
            secret: SECRET.to_string(),
            issuer: "chat-api".to_string(),
            audience: "voice-sfu".to_string(),
            token_type: "sfu_join".to_string(),
            leeway_secs: 5,
        }
    }

    fn now() -> u64 {
        chrono::Utc::now().timestamp() as u64
    }

    fn mint(claims: serde_json::Value, alg: Algorithm) -> String {
        encode(
            &Header::new(alg),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn valid_claims() -> serde_json::Value {
        json!({
            "sub": 1001,
            "typ": "sfu_join",
            "iss": "chat-api",
            "aud": ["voice-sfu"],
            "exp": now() + 60,
            "iat": now(),
            "channel_id": "42",
            "guild_id": 7,
            "permissions": Permissions::CONNECT.bits() | Permissions::SPEAK.bits(),
            "moved": false,
        })
    }

    fn token_kind(err: Error) -> TokenErrorKind {
        match err.kind {
            ErrorKind::TokenError(kind) => kind,
            other => panic!("unexpected error kind {:?}", other),
        }
    }

    #[test]
    fn test_valid_token_with_bearer_prefix() {
        let validator = TokenValidator::new(&auth_config());
        let token = mint(valid_claims(), Algorithm::HS256);
        let grant = validator.validate(&format!("Bearer {}", token)).unwrap();
        assert_eq!(grant.user_id, "1001");
        assert_eq!(grant.channel_id.as_deref(), Some("42"));
        assert_eq!(grant.guild_id.as_deref(), Some("7"));
        assert!(grant.permissions.allows(Permissions::SPEAK));
        assert!(!grant.permissions.allows(Permissions::STREAM));
        assert!(!grant.moved);
    }

    #[test]
    fn test_numeric_and_string_subjects() {
        let validator = TokenValidator::new(&auth_config());
        let grant = validator
            .validate(&mint(valid_claims(), Algorithm::HS256))
            .unwrap();
        assert_eq!(grant.user_id, "1001");

        let mut claims = valid_claims();
        claims["sub"] = json!("1002");
        let grant = validator
            .validate(&mint(claims, Algorithm::HS256))
            .unwrap();
        assert_eq!(grant.user_id, "1002");
    }

    #[test]
    fn test_missing_or_empty_subject_is_rejected() {
        let validator = TokenValidator::new(&auth_config());
        let mut claims = valid_claims();
        claims.as_object_mut().unwrap().remove("sub");
        let err = validator
            .validate(&mint(claims, Algorithm::HS256))
            .unwrap_err();
        assert_eq!(token_kind(err), TokenErrorKind::Malformed);

        let mut claims = valid_claims();
        claims["sub"] = json!("");
        let err = validator
            .validate(&mint(claims, Algorithm::HS256))
            .unwrap_err();
        assert_eq!(token_kind(err), TokenErrorKind::Malformed);
    }

    #[test]
    fn test_moved_token_widens_permissions() {
        let validator = TokenValidator::new(&auth_config());
        let mut claims = valid_claims();
        claims["permissions"] = json!(0);
        claims["moved"] = json!(true);
        let grant = validator
            .validate(&mint(claims, Algorithm::HS256))
            .unwrap();
        assert!(grant.moved);
        assert!(grant.permissions.allows(Permissions::CONNECT | Permissions::STREAM));
    }

    #[test]
    fn test_other_algorithm_is_rejected() {
        let validator = TokenValidator::new(&auth_config());
        let token = mint(valid_claims(), Algorithm::HS512);
        let err = validator.validate(&token).unwrap_err();
        assert_eq!(token_kind(err), TokenErrorKind::InvalidAlgorithm);
    }

    #[test]
    fn test_wrong_audience_is_rejected() {
        let validator = TokenValidator::new(&auth_config());
        let mut claims = valid_claims();
        claims["aud"] = json!("chat-web");
        let err = validator
            .validate(&mint(claims, Algorithm::HS256))
            .unwrap_err();
        assert_eq!(token_kind(err), TokenErrorKind::InvalidAudience);
    }

    #[test]
    fn test_wrong_issuer_is_rejected() {
        let validator = TokenValidator::new(&auth_config());
        let mut claims = valid_claims();
        claims["iss"] = json!("someone-else");
        let err = validator
            .validate(&mint(claims, Algorithm::HS256))
            .unwrap_err();
        assert_eq!(token_kind(err), TokenErrorKind::InvalidIssuer);
    }

    #[test]
    fn test_expired_token_beyond_leeway() {
        let validator = TokenValidator::new(&auth_config());
        let mut claims = valid_claims();
        claims["exp"] = json!(now() - 120);
        let err = validator
            .validate(&mint(claims, Algorithm::HS256))
            .unwrap_err();
        assert_eq!(token_kind(err), TokenErrorKind::Expired);
    }

    #[test]
    fn test_expired_within_leeway_is_accepted() {
        let validator = TokenValidator::new(&auth_config());
        let mut claims = valid_claims();
        claims["exp"] = json!(now() - 2);
        assert!(validator.validate(&mint(claims, Algorithm::HS256)).is_ok());
    }

    #[test]
    fn test_wrong_token_type_is_rejected() {
        let validator = TokenValidator::new(&auth_config());
        let mut claims = valid_claims();
        claims["typ"] = json!("access");
        let err = validator
            .validate(&mint(claims, Algorithm::HS256))
            .unwrap_err();
        assert_eq!(token_kind(err), TokenErrorKind::InvalidTokenType);
    }

    #[test]
    fn test_bad_signature_and_garbage() {
        let validator = TokenValidator::new(&auth_config());
        let forged = encode(
            &Header::new(Algorithm::HS256),
            &valid_claims(),
            &EncodingKey::from_secret(b"other-secret"),
        )
        .unwrap();
        assert_eq!(
            token_kind(validator.validate(&forged).unwrap_err()),
            TokenErrorKind::InvalidSignature
        );
        assert_eq!(
            token_kind(validator.validate("not.a.jwt").unwrap_err()),
            TokenErrorKind::Malformed
        );
        assert_eq!(
            token_kind(validator.validate("Bearer ").unwrap_err()),
            TokenErrorKind::Malformed
        );
    }
}
