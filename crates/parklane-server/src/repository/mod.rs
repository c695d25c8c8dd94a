//! Postgres repository.
//!
//! Every function takes a `&PgPool` and returns `Result<T, ApiError>`.
//! All statements are parameterized, and every tenant-scoped query
//! carries an explicit `tenant_id` predicate.
//!
//! Underneath the predicates sit the row-level-security policies from
//! the migrations. They key on two transaction-local settings, so every
//! repository function runs inside a scoped transaction from one of the
//! helpers below: [`tenant_tx`] pins `parklane.tenant_id` to the acting
//! tenant, [`system_tx`] raises `parklane.bypass_rls` for the platform
//! actors (ingest resolution, dispatcher, sweeps) that legitimately see
//! across tenants. Tables are under `FORCE ROW LEVEL SECURITY`, so a
//! query that skips both helpers reads zero rows — loudly, not quietly.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::ApiError;

pub mod audit;
pub mod devices;
pub mod downlinks;
pub mod orphans;
pub mod policy;
pub mod readings;
pub mod reservations;
pub mod service_keys;
pub mod spaces;
pub mod tenants;
pub mod users;

/// Begin a transaction scoped to one tenant.
///
/// `set_config(..., true)` is transaction-local, so the setting dies
/// with the commit or rollback and never leaks to the next checkout of
/// the pooled connection.
pub(crate) async fn tenant_tx(
    pool: &PgPool,
    tenant_id: Uuid,
) -> Result<Transaction<'_, Postgres>, ApiError> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT set_config('parklane.tenant_id', $1, true)")
        .bind(tenant_id.to_string())
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// Begin a transaction for a platform actor that crosses tenants.
pub(crate) async fn system_tx(pool: &PgPool) -> Result<Transaction<'_, Postgres>, ApiError> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT set_config('parklane.bypass_rls', 'on', true)")
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}
