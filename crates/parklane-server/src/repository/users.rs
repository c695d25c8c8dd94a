//! User, membership, and refresh-token queries.
//!
//! The users table is global. Memberships and refresh tokens are
//! tenant-scoped rows, but every function here serves the credential
//! path — login, rotation, reuse detection — which runs *before* a
//! tenant context exists, so they operate as the platform actor.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{Membership, RefreshToken, User};

use super::system_tx;

/// Get a user by email.
pub async fn get_by_email(pool: &PgPool, email: &str) -> Result<Option<User>, ApiError> {
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = lower($1)")
        .bind(email)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

/// Get a user by id.
pub async fn get(pool: &PgPool, user_id: Uuid) -> Result<User, ApiError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("user not found".to_owned()))
}

/// List a user's memberships.
pub async fn memberships(pool: &PgPool, user_id: Uuid) -> Result<Vec<Membership>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let rows = sqlx::query_as::<_, Membership>(
        "SELECT * FROM memberships WHERE user_id = $1 ORDER BY created_at",
    )
    .bind(user_id)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(rows)
}

/// Get the membership joining a user to a tenant.
pub async fn membership(
    pool: &PgPool,
    user_id: Uuid,
    tenant_id: Uuid,
) -> Result<Option<Membership>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let row = sqlx::query_as::<_, Membership>(
        "SELECT * FROM memberships WHERE user_id = $1 AND tenant_id = $2",
    )
    .bind(user_id)
    .bind(tenant_id)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

// ── Refresh tokens ───────────────────────────────────────────────────

/// Window after rotation during which re-presenting the old token is
/// treated as theft and revokes the whole family.
pub const REUSE_WINDOW_SECS: i64 = 300;

/// Insert a refresh token.
pub async fn insert_refresh_token(
    pool: &PgPool,
    user_id: Uuid,
    tenant_id: Uuid,
    family_id: Uuid,
    token_hash: &str,
    expires_at: DateTime<Utc>,
) -> Result<RefreshToken, ApiError> {
    let mut tx = system_tx(pool).await?;
    let row = sqlx::query_as::<_, RefreshToken>(
        r"INSERT INTO refresh_tokens (user_id, tenant_id, family_id, token_hash, expires_at)
          VALUES ($1, $2, $3, $4, $5)
          RETURNING *",
    )
    .bind(user_id)
    .bind(tenant_id)
    .bind(family_id)
    .bind(token_hash)
    .bind(expires_at)
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

/// Look up a refresh token by hash, regardless of state.
pub async fn find_refresh_token(
    pool: &PgPool,
    token_hash: &str,
) -> Result<Option<RefreshToken>, ApiError> {
    let mut tx = system_tx(pool).await?;
    let row = sqlx::query_as::<_, RefreshToken>(
        "SELECT * FROM refresh_tokens WHERE token_hash = $1",
    )
    .bind(token_hash)
    .fetch_optional(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(row)
}

/// Mark a refresh token rotated.
pub async fn mark_rotated(pool: &PgPool, token_id: Uuid) -> Result<(), ApiError> {
    let mut tx = system_tx(pool).await?;
    sqlx::query("UPDATE refresh_tokens SET rotated_at = now() WHERE id = $1")
        .bind(token_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Revoke every live token in a family (reuse detection).
pub async fn revoke_family(pool: &PgPool, family_id: Uuid) -> Result<u64, ApiError> {
    let mut tx = system_tx(pool).await?;
    let result = sqlx::query(
        "UPDATE refresh_tokens SET revoked_at = now() WHERE family_id = $1 AND revoked_at IS NULL",
    )
    .bind(family_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

/// Delete tokens expired past the grace window.
pub async fn cleanup_refresh_tokens(pool: &PgPool, grace_days: i64) -> Result<u64, ApiError> {
    let mut tx = system_tx(pool).await?;
    let result = sqlx::query(
        "DELETE FROM refresh_tokens WHERE expires_at < now() - make_interval(days => $1::int)",
    )
    .bind(grace_days)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}
