use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::domain::{CaseId, Role, Transaction};

/// SQLite-backed case store. The server uses it as the canonical record of
/// every case; the simulated backend uses it as its durable local store, one
/// row per case id. Stored state is serialized JSON and assumed
/// forward-compatible (no schema versioning).
#[derive(Clone)]
pub struct TrustStore {
    pool: Pool<Sqlite>,
}

impl TrustStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cases (
                id         TEXT PRIMARY KEY,
                state      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure cases table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS exchange_tokens (
                token      TEXT PRIMARY KEY,
                case_id    TEXT NOT NULL,
                role       TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                used_at    TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure exchange_tokens table exists")?;

        Ok(())
    }

    pub async fn load_case(&self, case_id: &CaseId) -> Result<Option<Transaction>> {
        let row = sqlx::query("SELECT state FROM cases WHERE id = ?1")
            .bind(case_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load case {case_id}"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let state: String = row.try_get("state")?;
        let tx = serde_json::from_str(&state)
            .with_context(|| format!("stored state for case {case_id} is not valid JSON"))?;
        Ok(Some(tx))
    }

    pub async fn save_case(&self, tx: &Transaction) -> Result<()> {
        let state = serde_json::to_string(tx).context("failed to serialize case state")?;
        sqlx::query(
            "INSERT OR REPLACE INTO cases (id, state, updated_at) VALUES (?1, ?2, ?3)",
        )
        .bind(tx.id.as_str())
        .bind(state)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save case {}", tx.id))?;
        Ok(())
    }

    pub async fn load_or_create(&self, case_id: &CaseId) -> Result<Transaction> {
        if let Some(tx) = self.load_case(case_id).await? {
            return Ok(tx);
        }
        let tx = Transaction::initial(case_id.clone());
        self.save_case(&tx).await?;
        Ok(tx)
    }

    pub async fn insert_exchange_token(
        &self,
        token: &str,
        case_id: &CaseId,
        role: Role,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO exchange_tokens (token, case_id, role, expires_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(token)
        .bind(case_id.as_str())
        .bind(role.as_str())
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("failed to insert exchange token")?;
        Ok(())
    }

    /// Marks a token used and returns its grant. Single use: a second call for
    /// the same token, or a call past its expiry, returns `None`.
    pub async fn consume_exchange_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(CaseId, Role)>> {
        let updated = sqlx::query(
            r#"
            UPDATE exchange_tokens
               SET used_at = ?1
             WHERE token = ?2 AND used_at IS NULL AND expires_at > ?1
            "#,
        )
        .bind(now)
        .bind(token)
        .execute(&self.pool)
        .await
        .context("failed to consume exchange token")?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        let row = sqlx::query("SELECT case_id, role FROM exchange_tokens WHERE token = ?1")
            .bind(token)
            .fetch_one(&self.pool)
            .await
            .context("failed to read consumed exchange token")?;

        let case_id: String = row.try_get("case_id")?;
        let role: String = row.try_get("role")?;
        let role = match role.as_str() {
            "agent" => Role::Agent,
            "buyer" => Role::Buyer,
            other => anyhow::bail!("exchange token carries unknown role '{other}'"),
        };
        Ok(Some((CaseId::new(case_id), role)))
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;
    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
