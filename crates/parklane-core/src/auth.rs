//! Principals, roles, scopes, and credentials.
//!
//! Three credential shapes reach the API:
//!
//! 1. **User sessions** — a short-lived HS256 access token carrying
//!    (user, tenant, role), paired with an opaque rotating refresh token.
//! 2. **Service keys** — opaque `plk_…` strings stored only as SHA-256
//!    hashes, bound to one tenant, carrying explicit scopes.
//! 3. **Anonymous** — health probes and login itself.
//!
//! Passwords use Argon2id. Service keys and refresh tokens carry ≥ 128
//! bits of OS randomness, so a plain SHA-256 of the opaque string is a
//! sufficient storage hash.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AuthError;

// ── Roles ────────────────────────────────────────────────────────────

/// Membership roles, ordered by privilege.
///
/// `PlatformAdmin` is not a membership role — it is a user-level flag
/// that dominates every tenant role and unlocks tenant switching.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
    Owner,
    PlatformAdmin,
}

impl Role {
    /// The stored role string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Viewer => "viewer",
            Self::Operator => "operator",
            Self::Admin => "admin",
            Self::Owner => "owner",
            Self::PlatformAdmin => "platform_admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Self::Viewer),
            "operator" => Ok(Self::Operator),
            "admin" => Ok(Self::Admin),
            "owner" => Ok(Self::Owner),
            "platform_admin" | "platform-admin" => Ok(Self::PlatformAdmin),
            other => Err(AuthError::Unauthenticated(format!("unknown role: {other}"))),
        }
    }
}

// ── Scopes ───────────────────────────────────────────────────────────

/// Does a granted scope satisfy a required one?
///
/// `admin:*` grants everything. Within a resource, `*` and `write` imply
/// `read`. Verbs that are neither `read` nor `write` (e.g. `ingest`)
/// require an exact grant.
#[must_use]
pub fn scope_allows(granted: &str, required: &str) -> bool {
    if granted == required || granted == "admin:*" {
        return true;
    }
    let (Some((g_res, g_verb)), Some((r_res, r_verb))) =
        (granted.split_once(':'), required.split_once(':'))
    else {
        return false;
    };
    if g_res != r_res {
        return false;
    }
    match (g_verb, r_verb) {
        ("*", _) => true,
        ("write", "read") => true,
        _ => false,
    }
}

/// Does any scope in the set satisfy the requirement?
#[must_use]
pub fn scopes_allow(granted: &[String], required: &str) -> bool {
    granted.iter().any(|g| scope_allows(g, required))
}

// ── Principal ────────────────────────────────────────────────────────

/// The resolved identity of a request.
#[derive(Debug, Clone)]
pub enum Principal {
    /// A user acting within one tenant.
    UserSession {
        user_id: Uuid,
        tenant_id: Uuid,
        role: Role,
        /// Set when a platform admin switched into a foreign tenant.
        cross_tenant: bool,
    },
    /// A machine credential bound to one tenant.
    ServiceKey {
        key_id: Uuid,
        tenant_id: Uuid,
        scopes: Vec<String>,
    },
    /// No credentials presented.
    Anonymous,
}

impl Principal {
    /// The tenant this principal acts within.
    #[must_use]
    pub fn tenant_id(&self) -> Option<Uuid> {
        match self {
            Self::UserSession { tenant_id, .. } | Self::ServiceKey { tenant_id, .. } => {
                Some(*tenant_id)
            }
            Self::Anonymous => None,
        }
    }

    /// Actor label for audit entries.
    #[must_use]
    pub fn actor(&self) -> String {
        match self {
            Self::UserSession { user_id, .. } => format!("user:{user_id}"),
            Self::ServiceKey { key_id, .. } => format!("service-key:{key_id}"),
            Self::Anonymous => "anonymous".to_owned(),
        }
    }

    /// Require a scope.
    ///
    /// Service keys check their scope set. User sessions map roles onto
    /// scopes: any role may read, operators and above may write, admins
    /// and above hold `admin:*`. Webhook ingest never authenticates via a
    /// session.
    pub fn require_scope(&self, required: &str) -> Result<(), AuthError> {
        match self {
            Self::ServiceKey { scopes, .. } => {
                if scopes_allow(scopes, required) {
                    Ok(())
                } else {
                    Err(AuthError::Forbidden(format!("missing scope {required}")))
                }
            }
            Self::UserSession { role, .. } => {
                let allowed = match required.split_once(':').map(|(_, verb)| verb) {
                    Some("read") => true,
                    Some("write") => *role >= Role::Operator,
                    Some("*") => *role >= Role::Admin,
                    _ => false,
                };
                if allowed {
                    Ok(())
                } else {
                    Err(AuthError::Forbidden(format!(
                        "role {role} lacks scope {required}"
                    )))
                }
            }
            Self::Anonymous => Err(AuthError::Unauthenticated(
                "authentication required".to_owned(),
            )),
        }
    }

    /// Require at least `min` role.
    ///
    /// Service keys satisfy role checks up to `Admin` through `admin:*`;
    /// owner- and platform-level actions are user-only.
    pub fn require_role(&self, min: Role) -> Result<(), AuthError> {
        match self {
            Self::UserSession { role, .. } => {
                if *role >= min {
                    Ok(())
                } else {
                    Err(AuthError::Forbidden(format!("requires role {min} or above")))
                }
            }
            Self::ServiceKey { scopes, .. } => {
                if min <= Role::Admin && scopes_allow(scopes, "admin:*") {
                    Ok(())
                } else {
                    Err(AuthError::Forbidden(format!("requires role {min} or above")))
                }
            }
            Self::Anonymous => Err(AuthError::Unauthenticated(
                "authentication required".to_owned(),
            )),
        }
    }
}

// ── Access tokens ────────────────────────────────────────────────────

/// Claims carried by an access token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    /// User id.
    pub sub: Uuid,
    /// Tenant id the session is scoped to.
    pub ten: Uuid,
    /// Role within that tenant.
    pub rol: Role,
    /// Cross-tenant session (platform admin switched in).
    #[serde(default)]
    pub xta: bool,
    /// Token id, for audit correlation.
    pub jti: Uuid,
    pub iat: i64,
    pub exp: i64,
}

/// Issue an access token.
pub fn issue_access_token(
    secret: &[u8],
    user_id: Uuid,
    tenant_id: Uuid,
    role: Role,
    cross_tenant: bool,
    issued_at: DateTime<Utc>,
    ttl: Duration,
) -> Result<String, AuthError> {
    let claims = AccessClaims {
        sub: user_id,
        ten: tenant_id,
        rol: role,
        xta: cross_tenant,
        jti: Uuid::new_v4(),
        iat: issued_at.timestamp(),
        exp: (issued_at + ttl).timestamp(),
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| AuthError::TokenCodec(e.to_string()))
}

/// Decode and validate an access token.
pub fn decode_access_token(secret: &[u8], token: &str) -> Result<AccessClaims, AuthError> {
    jsonwebtoken::decode::<AccessClaims>(
        token,
        &DecodingKey::from_secret(secret),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
        _ => AuthError::Unauthenticated("invalid access token".to_owned()),
    })
}

// ── Opaque credentials ───────────────────────────────────────────────

/// Prefix for service keys.
pub const SERVICE_KEY_PREFIX: &str = "plk_";
/// Prefix for refresh tokens.
pub const REFRESH_TOKEN_PREFIX: &str = "plr_";

/// Generate an opaque credential: prefix + 256 bits of OS randomness.
#[must_use]
pub fn generate_opaque(prefix: &str) -> String {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    format!("{prefix}{}{}", a.as_simple(), b.as_simple())
}

/// Hash an opaque credential for storage and lookup.
#[must_use]
pub fn hash_opaque(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Display prefix for key listings (first 12 chars).
#[must_use]
pub fn opaque_prefix(token: &str) -> String {
    let end = token.len().min(12);
    format!("{}…", &token[..end])
}

// ── Passwords ────────────────────────────────────────────────────────

/// Hash a password with Argon2id and a fresh salt.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Hashing(e.to_string()))
}

/// Verify a password against a stored hash.
pub fn verify_password(password: &str, stored: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(stored).map_err(|e| AuthError::Hashing(e.to_string()))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering() {
        assert!(Role::Viewer < Role::Operator);
        assert!(Role::Operator < Role::Admin);
        assert!(Role::Admin < Role::Owner);
        assert!(Role::Owner < Role::PlatformAdmin);
    }

    #[test]
    fn scope_implication() {
        assert!(scope_allows("spaces:read", "spaces:read"));
        assert!(scope_allows("spaces:write", "spaces:read"));
        assert!(scope_allows("spaces:*", "spaces:write"));
        assert!(scope_allows("admin:*", "reservations:write"));
        assert!(scope_allows("admin:*", "webhook:ingest"));

        assert!(!scope_allows("spaces:read", "spaces:write"));
        assert!(!scope_allows("spaces:write", "reservations:read"));
        assert!(!scope_allows("reservations:write", "webhook:ingest"));
        assert!(!scope_allows("webhook:ingest", "spaces:read"));
    }

    #[test]
    fn service_key_scope_checks() {
        let key = Principal::ServiceKey {
            key_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            scopes: vec!["spaces:write".to_owned(), "webhook:ingest".to_owned()],
        };
        assert!(key.require_scope("spaces:read").is_ok());
        assert!(key.require_scope("spaces:write").is_ok());
        assert!(key.require_scope("webhook:ingest").is_ok());
        assert!(key.require_scope("reservations:write").is_err());
    }

    #[test]
    fn user_session_scope_by_role() {
        let viewer = Principal::UserSession {
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            role: Role::Viewer,
            cross_tenant: false,
        };
        assert!(viewer.require_scope("spaces:read").is_ok());
        assert!(viewer.require_scope("spaces:write").is_err());

        let operator = Principal::UserSession {
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            role: Role::Operator,
            cross_tenant: false,
        };
        assert!(operator.require_scope("reservations:write").is_ok());
        assert!(operator.require_scope("admin:*").is_err());
        assert!(operator.require_scope("webhook:ingest").is_err());
    }

    #[test]
    fn role_requirements() {
        let admin = Principal::UserSession {
            user_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            role: Role::Admin,
            cross_tenant: false,
        };
        assert!(admin.require_role(Role::Operator).is_ok());
        assert!(admin.require_role(Role::Admin).is_ok());
        assert!(admin.require_role(Role::Owner).is_err());

        let admin_key = Principal::ServiceKey {
            key_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            scopes: vec!["admin:*".to_owned()],
        };
        assert!(admin_key.require_role(Role::Admin).is_ok());
        assert!(admin_key.require_role(Role::Owner).is_err());
    }

    #[test]
    fn anonymous_is_unauthenticated() {
        assert!(matches!(
            Principal::Anonymous.require_scope("spaces:read"),
            Err(AuthError::Unauthenticated(_))
        ));
    }

    #[test]
    fn access_token_roundtrip() {
        let secret = b"test-signing-secret";
        let user = Uuid::new_v4();
        let tenant = Uuid::new_v4();
        let token = issue_access_token(
            secret,
            user,
            tenant,
            Role::Admin,
            false,
            Utc::now(),
            Duration::seconds(900),
        )
        .unwrap();

        let claims = decode_access_token(secret, &token).unwrap();
        assert_eq!(claims.sub, user);
        assert_eq!(claims.ten, tenant);
        assert_eq!(claims.rol, Role::Admin);
        assert!(!claims.xta);
    }

    #[test]
    fn expired_access_token_rejected() {
        let secret = b"test-signing-secret";
        let token = issue_access_token(
            secret,
            Uuid::new_v4(),
            Uuid::new_v4(),
            Role::Viewer,
            false,
            Utc::now() - Duration::hours(2),
            Duration::seconds(900),
        )
        .unwrap();
        assert!(matches!(
            decode_access_token(secret, &token),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = issue_access_token(
            b"secret-a",
            Uuid::new_v4(),
            Uuid::new_v4(),
            Role::Viewer,
            false,
            Utc::now(),
            Duration::seconds(900),
        )
        .unwrap();
        assert!(decode_access_token(b"secret-b", &token).is_err());
    }

    #[test]
    fn opaque_credentials_are_unique_and_prefixed() {
        let a = generate_opaque(SERVICE_KEY_PREFIX);
        let b = generate_opaque(SERVICE_KEY_PREFIX);
        assert_ne!(a, b);
        assert!(a.starts_with("plk_"));
        assert_eq!(a.len(), 4 + 64);
        assert_eq!(hash_opaque(&a).len(), 64);
        assert!(opaque_prefix(&a).starts_with("plk_"));
    }

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("hunter2-but-long").unwrap();
        assert!(verify_password("hunter2-but-long", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
        assert!(hash.starts_with("$argon2"));
    }
}
