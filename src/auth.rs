use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::debug;

use crate::error::AppError;

/// Checks that a bearer token was issued for the courier it claims to be.
pub trait SubjectVerifier: Send + Sync {
    fn verify(&self, token: &str, subject: &str) -> Result<(), AppError>;
}

#[derive(Debug, Deserialize)]
struct CourierClaims {
    #[serde(default)]
    courier_id: Option<String>,
    #[serde(default)]
    sub: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    exp: Option<i64>,
}

impl CourierClaims {
    fn subject(&self) -> Option<&str> {
        self.courier_id.as_deref().or(self.sub.as_deref())
    }
}

/// HS256 tokens carrying the courier id in `courier_id`, or `sub` as a fallback.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // exp is checked when present but not demanded
        validation.required_spec_claims.clear();

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl SubjectVerifier for JwtVerifier {
    fn verify(&self, token: &str, subject: &str) -> Result<(), AppError> {
        if token.is_empty() || subject.is_empty() {
            return Err(AppError::Unauthorized);
        }

        let data = decode::<CourierClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|err| {
                debug!(error = %err, "rejected courier token");
                AppError::Unauthorized
            })?;

        match data.claims.subject() {
            Some(claimed) if claimed == subject => Ok(()),
            _ => Err(AppError::Unauthorized),
        }
    }
}
