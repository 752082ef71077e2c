use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub session_id: String,
    pub client_cookie: String,
    pub client_uat: String,
    pub project_id: String,
    pub user_id: String,
    pub email: String,
    pub agent_mode: String,
    pub weight: i64,
    pub enabled: bool,
    pub usage_current: i64,
    pub usage_total: i64,
    pub usage_reset_at: Option<String>,
    pub request_count: i64,
    pub last_used_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: i64,
    pub model_id: String,
    pub channel: String,
    pub upstream_model: String,
    pub display_name: String,
    pub enabled: bool,
    pub is_default: bool,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewAccount {
    pub name: String,
    pub session_id: String,
    #[serde(default)]
    pub client_cookie: String,
    #[serde(default)]
    pub client_uat: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub agent_mode: String,
    #[serde(default = "default_weight")]
    pub weight: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> i64 {
    1
}

fn default_enabled() -> bool {
    true
}

impl Default for NewAccount {
    fn default() -> Self {
        Self {
            name: String::new(),
            session_id: String::new(),
            client_cookie: String::new(),
            client_uat: String::new(),
            project_id: String::new(),
            user_id: String::new(),
            email: String::new(),
            agent_mode: String::new(),
            weight: default_weight(),
            enabled: default_enabled(),
        }
    }
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

/// Catalog of upstream accounts and model descriptors. The admin surface that
/// writes these rows lives outside this service; the gateway only reads them
/// and bumps usage counters.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub async fn new(dsn: &str) -> Result<Self, String> {
        ensure_sqlite_file(dsn)?;
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(
                dsn.parse::<sqlx::sqlite::SqliteConnectOptions>()
                    .map_err(|e| e.to_string())?
                    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                    .busy_timeout(std::time::Duration::from_secs(5)),
            )
            .await
            .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                session_id TEXT NOT NULL,
                client_cookie TEXT NOT NULL DEFAULT '',
                client_uat TEXT NOT NULL DEFAULT '',
                project_id TEXT NOT NULL DEFAULT '',
                user_id TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL DEFAULT '',
                agent_mode TEXT NOT NULL DEFAULT '',
                weight INTEGER NOT NULL DEFAULT 1,
                enabled INTEGER NOT NULL DEFAULT 1,
                usage_current INTEGER NOT NULL DEFAULT 0,
                usage_total INTEGER NOT NULL DEFAULT 0,
                usage_reset_at TEXT,
                request_count INTEGER NOT NULL DEFAULT 0,
                last_used_at TEXT
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS models (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                model_id TEXT NOT NULL,
                channel TEXT NOT NULL DEFAULT 'orchids',
                upstream_model TEXT NOT NULL DEFAULT '',
                display_name TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                is_default INTEGER NOT NULL DEFAULT 0,
                sort_order INTEGER NOT NULL DEFAULT 0,
                UNIQUE (model_id, channel)
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_accounts_enabled ON accounts(enabled)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_models_channel ON models(channel)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    /// Enabled accounts sorted by descending weight then id; the balancer
    /// relies on this ordering for deterministic tie-breaks.
    pub async fn list_enabled_accounts(&self) -> Result<Vec<Account>, String> {
        let rows = sqlx::query(
            r#"SELECT id, name, session_id, client_cookie, client_uat, project_id, user_id,
                      email, agent_mode, weight, enabled, usage_current, usage_total,
                      usage_reset_at, request_count, last_used_at
               FROM accounts
               WHERE enabled = 1
               ORDER BY weight DESC, id ASC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        rows.iter().map(row_to_account).collect()
    }

    pub async fn increment_request_count(&self, id: i64) -> Result<(), String> {
        sqlx::query(
            "UPDATE accounts SET request_count = request_count + 1, last_used_at = ? WHERE id = ?",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn increment_usage(&self, id: i64) -> Result<(), String> {
        sqlx::query(
            "UPDATE accounts SET usage_current = usage_current + 1, usage_total = usage_total + 1 WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn create_account(&self, input: NewAccount) -> Result<Account, String> {
        if input.name.trim().is_empty() {
            return Err("account name must not be empty".to_string());
        }
        let weight = input.weight.max(1);
        let result = sqlx::query(
            r#"INSERT INTO accounts
               (name, session_id, client_cookie, client_uat, project_id, user_id, email,
                agent_mode, weight, enabled)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&input.name)
        .bind(&input.session_id)
        .bind(&input.client_cookie)
        .bind(&input.client_uat)
        .bind(&input.project_id)
        .bind(&input.user_id)
        .bind(&input.email)
        .bind(&input.agent_mode)
        .bind(weight)
        .bind(input.enabled)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let id = result.last_insert_rowid();
        self.get_account(id)
            .await?
            .ok_or_else(|| "account not found after create".to_string())
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>, String> {
        let row = sqlx::query(
            r#"SELECT id, name, session_id, client_cookie, client_uat, project_id, user_id,
                      email, agent_mode, weight, enabled, usage_current, usage_total,
                      usage_reset_at, request_count, last_used_at
               FROM accounts WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.as_ref().map(row_to_account).transpose()
    }

    pub async fn set_account_enabled(&self, id: i64, enabled: bool) -> Result<(), String> {
        sqlx::query("UPDATE accounts SET enabled = ? WHERE id = ?")
            .bind(enabled)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn list_models(&self) -> Result<Vec<ModelRecord>, String> {
        let rows = sqlx::query(
            r#"SELECT id, model_id, channel, upstream_model, display_name, enabled,
                      is_default, sort_order
               FROM models
               ORDER BY sort_order ASC, id ASC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_model).collect()
    }

    /// Looks a model up by its public id. When several channels expose the
    /// same id, the channel's default row wins.
    pub async fn get_model_by_model_id(&self, model_id: &str) -> Result<Option<ModelRecord>, String> {
        let rows = sqlx::query(
            r#"SELECT id, model_id, channel, upstream_model, display_name, enabled,
                      is_default, sort_order
               FROM models
               WHERE model_id = ? AND enabled = 1
               ORDER BY is_default DESC, sort_order ASC, id ASC"#,
        )
        .bind(model_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.first().map(row_to_model).transpose()
    }

    pub async fn upsert_model(&self, model: &ModelRecord) -> Result<(), String> {
        if model.is_default {
            // Keep the one-default-per-channel invariant on write.
            sqlx::query("UPDATE models SET is_default = 0 WHERE channel = ? AND model_id != ?")
                .bind(&model.channel)
                .bind(&model.model_id)
                .execute(&self.pool)
                .await
                .map_err(|e| e.to_string())?;
        }
        sqlx::query(
            r#"INSERT INTO models (model_id, channel, upstream_model, display_name, enabled, is_default, sort_order)
               VALUES (?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(model_id, channel) DO UPDATE SET
                 upstream_model = excluded.upstream_model,
                 display_name = excluded.display_name,
                 enabled = excluded.enabled,
                 is_default = excluded.is_default,
                 sort_order = excluded.sort_order"#,
        )
        .bind(&model.model_id)
        .bind(&model.channel)
        .bind(&model.upstream_model)
        .bind(&model.display_name)
        .bind(model.enabled)
        .bind(model.is_default)
        .bind(model.sort_order)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }
}

fn row_to_account(row: &sqlx::sqlite::SqliteRow) -> Result<Account, String> {
    Ok(Account {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        name: row.try_get("name").map_err(|e| e.to_string())?,
        session_id: row.try_get("session_id").map_err(|e| e.to_string())?,
        client_cookie: row.try_get("client_cookie").map_err(|e| e.to_string())?,
        client_uat: row.try_get("client_uat").map_err(|e| e.to_string())?,
        project_id: row.try_get("project_id").map_err(|e| e.to_string())?,
        user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
        email: row.try_get("email").map_err(|e| e.to_string())?,
        agent_mode: row.try_get("agent_mode").map_err(|e| e.to_string())?,
        weight: row.try_get("weight").map_err(|e| e.to_string())?,
        enabled: row.try_get("enabled").map_err(|e| e.to_string())?,
        usage_current: row.try_get("usage_current").map_err(|e| e.to_string())?,
        usage_total: row.try_get("usage_total").map_err(|e| e.to_string())?,
        usage_reset_at: row.try_get("usage_reset_at").map_err(|e| e.to_string())?,
        request_count: row.try_get("request_count").map_err(|e| e.to_string())?,
        last_used_at: row.try_get("last_used_at").map_err(|e| e.to_string())?,
    })
}

fn row_to_model(row: &sqlx::sqlite::SqliteRow) -> Result<ModelRecord, String> {
    Ok(ModelRecord {
        id: row.try_get("id").map_err(|e| e.to_string())?,
        model_id: row.try_get("model_id").map_err(|e| e.to_string())?,
        channel: row.try_get("channel").map_err(|e| e.to_string())?,
        upstream_model: row.try_get("upstream_model").map_err(|e| e.to_string())?,
        display_name: row.try_get("display_name").map_err(|e| e.to_string())?,
        enabled: row.try_get("enabled").map_err(|e| e.to_string())?,
        is_default: row.try_get("is_default").map_err(|e| e.to_string())?,
        sort_order: row.try_get("sort_order").map_err(|e| e.to_string())?,
    })
}
