//! JWT verification shared by the HTTP API and the WebSocket gateway.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::zerg::domain::OwnerId;
use crate::zerg::error::ZergError;

/// Fixed owner used only when `AUTH_DISABLED=1`, a dev convenience never
/// reachable in a deployment that sets a real `JWT_SECRET`.
pub const DEV_OWNER_ID: OwnerId = Uuid::nil();

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Owner id, as a UUID string.
    pub sub: String,
    #[serde(default)]
    pub is_admin: bool,
    pub exp: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct AuthContext {
    pub owner_id: OwnerId,
    pub is_admin: bool,
}

/// Verifies a bearer token against `jwt_secret`. When `auth_disabled`, any
/// token (including none) resolves to [`DEV_OWNER_ID`] with admin rights.
pub fn authenticate(token: Option<&str>, jwt_secret: &str, auth_disabled: bool) -> Result<AuthContext, ZergError> {
    if auth_disabled {
        return Ok(AuthContext { owner_id: DEV_OWNER_ID, is_admin: true });
    }
    let token = token.ok_or_else(|| ZergError::auth("missing bearer token"))?;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| ZergError::auth(format!("invalid token: {e}")))?;

    let owner_id = Uuid::parse_str(&data.claims.sub).map_err(|_| ZergError::auth("malformed subject claim"))?;
    Ok(AuthContext { owner_id, is_admin: data.claims.is_admin })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(sub: &str, is_admin: bool, secret: &str) -> String {
        let claims = Claims { sub: sub.to_string(), is_admin, exp: 9_999_999_999 };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn valid_token_resolves_owner_and_admin_flag() {
        let owner = Uuid::new_v4();
        let token = token_for(&owner.to_string(), true, "secret");
        let ctx = authenticate(Some(&token), "secret", false).unwrap();
        assert_eq!(ctx.owner_id, owner);
        assert!(ctx.is_admin);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let owner = Uuid::new_v4();
        let token = token_for(&owner.to_string(), false, "secret");
        assert!(authenticate(Some(&token), "different", false).is_err());
    }

    #[test]
    fn missing_token_is_rejected_unless_auth_disabled() {
        assert!(authenticate(None, "secret", false).is_err());
        assert!(authenticate(None, "secret", true).is_ok());
    }
}
