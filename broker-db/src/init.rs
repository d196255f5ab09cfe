//! Administrator bootstrap.

use sqlx::PgPool;
use tracing::info;

use super::Result;

/// Ensure an administrator account exists.
///
/// Returns the id of the existing or newly created account. The password is
/// bcrypt-hashed before it is written.
pub async fn init_admin_account(pool: &PgPool, username: &str, password: &str) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM accounts WHERE role = 'admin' ORDER BY id LIMIT 1")
            .fetch_optional(&mut *tx)
            .await?;

    if let Some(id) = existing {
        info!(account_id = id, "Administrator account already present");
        tx.commit().await?;
        return Ok(id);
    }

    let password_hash = broker_store::hash_password(password).await?;
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO accounts (username, password_hash, role, is_active, activated_at)
        VALUES ($1, $2, 'admin', TRUE, now())
        ON CONFLICT (username) DO UPDATE
            SET role = 'admin', version = accounts.version + 1, updated_at = now()
        RETURNING id
        "#,
    )
    .bind(username)
    .bind(password_hash)
    .fetch_one(&mut *tx)
    .await?;

    tx.commit().await?;
    info!(account_id = id, %username, "Administrator account created");
    Ok(id)
}
