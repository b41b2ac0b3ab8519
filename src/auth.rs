use crate::entity::{Identity, Role};
use crate::error::ChatError;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Claims carried by tokens the marketplace auth service issues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: usize,
}

/// Resolves a caller to an [`Identity`]. Account management lives elsewhere;
/// this is only the boundary check used by register, join and the REST reads.
pub trait Authenticator: Send + Sync {
    /// `credential` is the bearer token, `claimed` the identity the client says it is.
    fn authenticate(
        &self,
        credential: Option<&str>,
        claimed: Option<&Identity>,
    ) -> Result<Identity, ChatError>;
}

pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(
        &self,
        credential: Option<&str>,
        claimed: Option<&Identity>,
    ) -> Result<Identity, ChatError> {
        let token = credential.ok_or(ChatError::Unauthorized)?;
        let claims = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| {
                debug!("Rejected chat token: {}", e);
                ChatError::Unauthorized
            })?
            .claims;

        let name = claimed
            .map(|c| c.name.clone())
            .filter(|n| !n.trim().is_empty())
            .or(claims.name)
            .unwrap_or_default();
        let identity = Identity::new(claims.sub, name, claims.role);

        if let Some(claimed) = claimed {
            if !claimed.same_account(&identity) {
                return Err(ChatError::Forbidden(
                    "token does not belong to the claimed identity".into(),
                ));
            }
        }

        Ok(identity)
    }
}

/// Development authenticator: believes whatever the client claims.
/// Bearer credentials are read as `role:id`, e.g. `vendor:v-42`.
pub struct TrustingAuthenticator;

impl Authenticator for TrustingAuthenticator {
    fn authenticate(
        &self,
        credential: Option<&str>,
        claimed: Option<&Identity>,
    ) -> Result<Identity, ChatError> {
        if let Some(claimed) = claimed {
            if claimed.id.trim().is_empty() {
                return Err(ChatError::BadRequest("identity id must not be empty".into()));
            }
            return Ok(claimed.clone());
        }

        let token = credential.ok_or(ChatError::Unauthorized)?;
        let (role, id) = token.split_once(':').ok_or(ChatError::Unauthorized)?;
        let role: Role = role.parse().map_err(|_| ChatError::Unauthorized)?;
        if id.trim().is_empty() {
            return Err(ChatError::Unauthorized);
        }
        Ok(Identity::new(id.trim(), "", role))
    }
}

/// Pick the authenticator for this process.
pub fn from_secret(secret: Option<&str>) -> Arc<dyn Authenticator> {
    match secret {
        Some(secret) => Arc::new(JwtAuthenticator::new(secret)),
        None => {
            warn!("CHAT_JWT_SECRET is not set: client identities are trusted without verification. DO NOT USE IN PRODUCTION");
            Arc::new(TrustingAuthenticator)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret";

    fn token(sub: &str, role: Role, expires_in: Duration) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            role,
            name: Some("Coral Bay Resort".into()),
            exp: (Utc::now() + expires_in).timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn jwt_resolves_identity() {
        let auth = JwtAuthenticator::new(SECRET);
        let jwt = token("v1", Role::Vendor, Duration::hours(1));

        let identity = auth.authenticate(Some(&jwt), None).unwrap();
        assert_eq!(identity, Identity::vendor("v1", "Coral Bay Resort"));

        let claimed = Identity::vendor("v1", "Coral Bay");
        let identity = auth.authenticate(Some(&jwt), Some(&claimed)).unwrap();
        assert_eq!(identity.name, "Coral Bay");
    }

    #[test]
    fn jwt_rejects_mismatch_expiry_and_missing_token() {
        let auth = JwtAuthenticator::new(SECRET);
        let jwt = token("v1", Role::Vendor, Duration::hours(1));

        let impostor = Identity::vendor("v2", "");
        assert!(matches!(
            auth.authenticate(Some(&jwt), Some(&impostor)),
            Err(ChatError::Forbidden(_))
        ));

        let expired = token("v1", Role::Vendor, Duration::hours(-2));
        assert!(matches!(
            auth.authenticate(Some(&expired), None),
            Err(ChatError::Unauthorized)
        ));
        assert!(matches!(
            auth.authenticate(None, None),
            Err(ChatError::Unauthorized)
        ));
        assert!(matches!(
            JwtAuthenticator::new("other").authenticate(Some(&jwt), None),
            Err(ChatError::Unauthorized)
        ));
    }

    #[test]
    fn trusting_reads_role_prefixed_bearer() {
        let auth = TrustingAuthenticator;
        assert_eq!(
            auth.authenticate(Some("user:u-7"), None).unwrap(),
            Identity::user("u-7", "")
        );
        assert!(auth.authenticate(Some("u-7"), None).is_err());
        assert!(auth.authenticate(Some("admin:a"), None).is_err());

        let claimed = Identity::user("u-8", "Mia");
        assert_eq!(auth.authenticate(None, Some(&claimed)).unwrap(), claimed);
    }
}
