use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

const ISSUER: &str = "medscreen";
const AUDIENCE: &str = "medscreen-api";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Doctor,
    Nurse,
    Receptionist,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::Doctor, Role::Nurse, Role::Receptionist];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Doctor => "doctor",
            Role::Nurse => "nurse",
            Role::Receptionist => "receptionist",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        Role::ALL.into_iter().find(|r| r.as_str() == s)
    }
}

/// Authenticated principal, inserted into request extensions by
/// [`crate::security::auth_guard`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthUser {
    pub user_id: i64,
    pub role: Role,
}

impl AuthUser {
    pub fn require(&self, allowed: &[Role]) -> Result<(), ApiError> {
        if allowed.contains(&self.role) {
            return Ok(());
        }
        Err(ApiError::forbidden("insufficient permissions"))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: Role,
    exp: usize,
    iat: usize,
    iss: String,
    aud: String,
}

pub fn validate_access_jwt(secret: &[u8], token: &str) -> anyhow::Result<AuthUser> {
    let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.set_audience(&[AUDIENCE]);
    validation.set_issuer(&[ISSUER]);

    let data = jsonwebtoken::decode::<Claims>(
        token,
        &jsonwebtoken::DecodingKey::from_secret(secret),
        &validation,
    )?;

    let user_id = data.claims.sub.parse::<i64>()?;
    Ok(AuthUser {
        user_id,
        role: data.claims.role,
    })
}

/// Signs an access token. Tokens are normally minted by the identity
/// service; this exists for tooling and tests.
pub fn issue_access_jwt(
    secret: &[u8],
    user_id: i64,
    role: Role,
    ttl: time::Duration,
) -> anyhow::Result<String> {
    let now = time::OffsetDateTime::now_utc();
    let claims = Claims {
        sub: user_id.to_string(),
        role,
        exp: (now + ttl).unix_timestamp() as usize,
        iat: now.unix_timestamp() as usize,
        iss: ISSUER.to_string(),
        aud: AUDIENCE.to_string(),
    };

    Ok(jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret),
    )?)
}

pub async fn whoami(Extension(user): Extension<AuthUser>) -> Json<AuthUser> {
    Json(user)
}
