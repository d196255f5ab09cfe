//! Migration and administrator bootstrap against PostgreSQL.
//!
//! Needs `DATABASE_URL`; run with `cargo test -p broker-db -- --ignored`.

use sqlx::{PgPool, Row};

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_status_reports_applied_migrations(pool: PgPool) {
    let status = broker_db::status(&pool).await.unwrap();

    assert_eq!(status.schema_version, Some(20240101000000));
    assert_eq!(status.pending_migrations, 0);
    assert_eq!(status.accounts, 0);
    assert_eq!(status.processing_tasks, 0);
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_admin_seeded_once(pool: PgPool) {
    let first = broker_db::init_admin_account(&pool, "root", "hunter2").await.unwrap();
    let second = broker_db::init_admin_account(&pool, "other", "ignored").await.unwrap();
    assert_eq!(first, second);

    let row = sqlx::query("SELECT username, role, password_hash FROM accounts WHERE id = $1")
        .bind(first)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.get::<String, _>("username"), "root");
    assert_eq!(row.get::<String, _>("role"), "admin");
    let hash: String = row.get("password_hash");
    assert!(broker_store::verify_password("hunter2", &hash).await);

    let admins: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts WHERE role = 'admin'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(admins, 1);
}

#[sqlx::test(migrations = "../migrations")]
#[ignore = "requires DATABASE_URL"]
async fn test_existing_user_promoted_to_admin(pool: PgPool) {
    let user_id: i64 =
        sqlx::query_scalar("INSERT INTO accounts (username) VALUES ('root') RETURNING id")
            .fetch_one(&pool)
            .await
            .unwrap();

    let admin_id = broker_db::init_admin_account(&pool, "root", "hunter2").await.unwrap();
    assert_eq!(admin_id, user_id);

    let version: i64 = sqlx::query_scalar("SELECT version FROM accounts WHERE id = $1")
        .bind(admin_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(version, 2);
}
