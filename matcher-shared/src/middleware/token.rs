use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::errors::{AppError, ErrorCode};
use crate::types::auth::{AuthUser, Claims};

/// Decodes and validates a bearer token against `secret`. Token issuance
/// belongs to the account service; this crate only ever verifies.
pub fn verify_token(token: &str, secret: &str) -> Result<AuthUser, AppError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let token_data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                AppError::new(ErrorCode::AuthFailure, "token has expired")
            }
            _ => AppError::new(ErrorCode::AuthFailure, format!("invalid token: {e}")),
        })?;

    if token_data.claims.is_expired() {
        return Err(AppError::new(ErrorCode::AuthFailure, "token has expired"));
    }

    Ok(AuthUser::from(token_data.claims))
}
