//! Postgres-backed identity backend.

use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, Connection, PgPool, Row};
use std::time::Duration;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use super::{BackendFuture, IdentityBackend, UserRecord, UNBOUND_UID};

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

const SELECT_USER_BY_NODE_ID: &str =
    "SELECT uuid, name, email, access_token, node_id FROM users WHERE node_id = $1";
const SELECT_USER_BY_UUID: &str =
    "SELECT uuid, name, email, access_token, node_id FROM users WHERE uuid = $1";

#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable or the schema cannot be applied.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;

        let backend = Self::new(pool);
        backend.migrate().await?;
        Ok(backend)
    }

    /// Apply `sql/schema.sql`; every statement is idempotent.
    ///
    /// # Errors
    /// Returns an error if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        let span = info_span!("db.query", db.system = "postgresql", db.operation = "MIGRATE");
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .instrument(span)
            .await
            .context("failed to apply schema")?;
        Ok(())
    }

    async fn find_user(&self, query: &'static str, value: &str) -> Result<Option<UserRecord>> {
        let span = info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(value)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await
            .context("failed to lookup user")?;

        Ok(row.map(|row| user_from_row(&row)))
    }
}

fn user_from_row(row: &PgRow) -> UserRecord {
    UserRecord {
        uuid: row.get("uuid"),
        name: row.get("name"),
        email: row.get("email"),
        access_token: SecretString::from(row.get::<String, _>("access_token")),
        node_id: row.get("node_id"),
    }
}

impl IdentityBackend for PgBackend {
    fn find_user_by_external_id<'a>(
        &'a self,
        node_id: &'a str,
    ) -> BackendFuture<'a, Option<UserRecord>> {
        Box::pin(self.find_user(SELECT_USER_BY_NODE_ID, node_id))
    }

    fn find_user_by_session_token<'a>(
        &'a self,
        token: &'a str,
    ) -> BackendFuture<'a, Option<UserRecord>> {
        Box::pin(self.find_user(SELECT_USER_BY_UUID, token))
    }

    fn insert_user<'a>(&'a self, user: &'a UserRecord) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let query = r"
                INSERT INTO users
                    (uuid, name, email, access_token, node_id)
                VALUES ($1, $2, $3, $4, $5)
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = query
            );
            sqlx::query(query)
                .bind(&user.uuid)
                .bind(&user.name)
                .bind(&user.email)
                .bind(user.access_token.expose_secret())
                .bind(&user.node_id)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to insert user")?;
            Ok(())
        })
    }

    fn insert_audit_row<'a>(
        &'a self,
        caller: &'a str,
        code: &'a str,
        session_id: Uuid,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let query = r"
                INSERT INTO verifications
                    (user_uuid, verify_code, verify_uuid, bili_uid)
                VALUES ($1, $2, $3, $4)
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "INSERT",
                db.statement = query
            );
            sqlx::query(query)
                .bind(caller)
                .bind(code)
                .bind(session_id)
                .bind(UNBOUND_UID)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to insert verification audit row")?;
            Ok(())
        })
    }

    fn bind_uid_if_unbound<'a>(&'a self, code: &'a str, uid: i64) -> BackendFuture<'a, bool> {
        Box::pin(async move {
            let query =
                "UPDATE verifications SET bili_uid = $1 WHERE verify_code = $2 AND bili_uid = $3";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            let result = sqlx::query(query)
                .bind(uid)
                .bind(code)
                .bind(UNBOUND_UID)
                .execute(&self.pool)
                .instrument(span)
                .await
                .context("failed to bind uid to verification")?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn ping(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            let acquire_span = info_span!(
                "db.acquire",
                db.system = "postgresql",
                db.operation = "ACQUIRE"
            );
            let mut conn = self
                .pool
                .acquire()
                .instrument(acquire_span)
                .await
                .context("failed to acquire database connection")?;
            let ping_span = info_span!("db.ping", db.system = "postgresql", db.operation = "PING");
            conn.ping()
                .instrument(ping_span)
                .await
                .context("failed to ping database")?;
            Ok(())
        })
    }
}
