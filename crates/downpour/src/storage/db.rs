use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, NaiveDateTime, Utc};
use indoc::indoc;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Result;
use secrecy::{ExposeSecret, SecretString};
use url::Url;
use uuid::Uuid;

use crate::credentials::CredentialKind;
use crate::queue::{Job, JobState};
use crate::source::{MediaFormat, Provider};

/// Строка таблицы credentials: состояние учётных данных между рестартами.
pub struct StoredCredential {
    /// Уникальный идентификатор учётных данных
    pub id: Uuid,
    /// Провайдер, к которому относятся учётные данные
    pub provider: Provider,
    /// Тип секрета: "cookie-file", "api-key"
    pub kind: CredentialKind,
    /// Человекочитаемая метка (обычно имя исходного файла)
    pub label: Option<String>,
    /// Секретное содержимое; в БД хранится в base64
    pub payload: Arc<SecretString>,
    /// Флаг карантина (true - выведены из ротации)
    pub quarantined: bool,
    /// Момент помещения в карантин
    pub quarantined_at: Option<DateTime<Utc>>,
    /// Счётчик подряд идущих ошибок авторизации
    pub failure_count: u32,
    /// Момент последнего использования
    pub last_used_at: Option<DateTime<Utc>>,
    /// Окончание окна охлаждения
    pub cooldown_until: Option<DateTime<Utc>>,
    /// Момент добавления в пул
    pub added_at: DateTime<Utc>,
}

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Create a new database connection pool
///
/// Initializes a connection pool with up to 10 connections and ensures the
/// schema exists.
///
/// # Arguments
///
/// * `database_path` - Path to SQLite database file
///
/// # Returns
///
/// Returns a `DbPool` on success or an `r2d2::Error` if pool creation fails.
///
/// # Example
///
/// ```no_run
/// use downpour::storage;
///
/// let pool = storage::create_pool("downpour.sqlite")?;
/// # Ok::<(), r2d2::Error>(())
/// ```
pub fn create_pool(database_path: &str) -> Result<DbPool, r2d2::Error> {
    let manager = SqliteConnectionManager::file(database_path);
    let pool = Pool::builder()
        .max_size(10) // Maximum 10 connections in the pool
        .build(manager)?;

    // Ensure schema is up to date on first connection
    let conn = pool.get()?;
    if let Err(e) = migrate_schema(&conn) {
        log::warn!("Failed to migrate schema: {}", e);
        // Don't fail on migration errors, as they might be expected
    }

    Ok(pool)
}

/// Get a connection from the pool
///
/// Retrieves a connection from the connection pool. The connection is
/// automatically returned to the pool when dropped.
///
/// # Arguments
///
/// * `pool` - Database connection pool
///
/// # Returns
///
/// Returns a `DbConnection` on success or an `r2d2::Error` if no connection is available.
///
/// # Example
///
/// ```no_run
/// use downpour::storage;
///
/// let pool = storage::create_pool("downpour.sqlite")?;
/// let conn = storage::get_connection(&pool)?;
/// // Use connection...
/// # Ok::<(), r2d2::Error>(())
/// ```
pub fn get_connection(pool: &DbPool) -> Result<DbConnection, r2d2::Error> {
    pool.get()
}

/// Migrate database schema to ensure all required tables exist
/// Tables are created lazily so a fresh database file just works
fn migrate_schema(conn: &rusqlite::Connection) -> Result<()> {
    // Create credentials table if it doesn't exist
    let credentials_exists: bool = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='credentials'",
        [],
        |row| Ok(row.get::<_, i32>(0)? > 0),
    )?;

    if !credentials_exists {
        log::info!("Creating credentials table");
        if let Err(e) = conn.execute(
            indoc! {"
                CREATE TABLE IF NOT EXISTS credentials (
                    id TEXT PRIMARY KEY,
                    provider TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    label TEXT,
                    payload TEXT NOT NULL,
                    quarantined INTEGER NOT NULL DEFAULT 0,
                    quarantined_at DATETIME,
                    failure_count INTEGER NOT NULL DEFAULT 0,
                    last_used_at DATETIME,
                    cooldown_until DATETIME,
                    added_at DATETIME NOT NULL
                )
            "},
            [],
        ) {
            log::warn!("Failed to create credentials table: {}", e);
        } else {
            // Index for provider-scoped rotation queries
            if let Err(e) = conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_credentials_provider ON credentials(provider)",
                [],
            ) {
                log::warn!("Failed to create index on credentials: {}", e);
            }
        }
    }

    // Create jobs table if it doesn't exist
    let jobs_exists: bool = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='jobs'",
        [],
        |row| Ok(row.get::<_, i32>(0)? > 0),
    )?;

    if !jobs_exists {
        log::info!("Creating jobs table");
        if let Err(e) = conn.execute(
            indoc! {"
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    user_id INTEGER NOT NULL,
                    provider TEXT NOT NULL,
                    url TEXT NOT NULL,
                    format TEXT NOT NULL,
                    quality TEXT,
                    state TEXT NOT NULL,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    created_at DATETIME NOT NULL,
                    last_error TEXT,
                    artifact_path TEXT,
                    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
                )
            "},
            [],
        ) {
            log::warn!("Failed to create jobs table: {}", e);
        } else {
            // Index for restart re-queue and retention sweeps
            if let Err(e) = conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)",
                [],
            ) {
                log::warn!("Failed to create index on jobs: {}", e);
            }
        }
    }

    Ok(())
}

/// Timestamp format compatible with SQLite CURRENT_TIMESTAMP, so chrono
/// values and database-stamped columns compare as strings.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn format_ts_opt(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(format_ts)
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(NaiveDateTime::parse_from_str(raw, TS_FORMAT)?.and_utc())
}

fn parse_ts_opt(raw: Option<String>) -> anyhow::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(&s)).transpose()
}

/// Сохраняет учётные данные в БД (вставка или обновление состояния)
pub fn save_credential(conn: &DbConnection, credential: &StoredCredential) -> Result<()> {
    let id = credential.id.to_string();
    let provider = credential.provider.to_string();
    let kind = credential.kind.to_string();
    let payload = general_purpose::STANDARD.encode(credential.payload.expose_secret());
    let quarantined_at = format_ts_opt(&credential.quarantined_at);
    let last_used_at = format_ts_opt(&credential.last_used_at);
    let cooldown_until = format_ts_opt(&credential.cooldown_until);
    let added_at = format_ts(&credential.added_at);

    conn.execute(
        "INSERT INTO credentials (id, provider, kind, label, payload, quarantined, quarantined_at, failure_count, last_used_at, cooldown_until, added_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
         quarantined = excluded.quarantined,
         quarantined_at = excluded.quarantined_at,
         failure_count = excluded.failure_count,
         last_used_at = excluded.last_used_at,
         cooldown_until = excluded.cooldown_until",
        &[
            &id as &dyn rusqlite::ToSql,
            &provider as &dyn rusqlite::ToSql,
            &kind as &dyn rusqlite::ToSql,
            &credential.label as &dyn rusqlite::ToSql,
            &payload as &dyn rusqlite::ToSql,
            &(if credential.quarantined { 1 } else { 0 }) as &dyn rusqlite::ToSql,
            &quarantined_at as &dyn rusqlite::ToSql,
            &(credential.failure_count as i64) as &dyn rusqlite::ToSql,
            &last_used_at as &dyn rusqlite::ToSql,
            &cooldown_until as &dyn rusqlite::ToSql,
            &added_at as &dyn rusqlite::ToSql,
        ],
    )?;
    Ok(())
}

/// Сырая строка таблицы credentials до декодирования
struct CredentialRow {
    id: String,
    provider: String,
    kind: String,
    label: Option<String>,
    payload: String,
    quarantined: i64,
    quarantined_at: Option<String>,
    failure_count: i64,
    last_used_at: Option<String>,
    cooldown_until: Option<String>,
    added_at: String,
}

/// Восстанавливает типизированные учётные данные из сырой строки
fn decode_credential(row: CredentialRow) -> anyhow::Result<StoredCredential> {
    let payload = general_purpose::STANDARD.decode(&row.payload)?;
    let payload = String::from_utf8(payload)?;

    Ok(StoredCredential {
        id: Uuid::parse_str(&row.id)?,
        provider: Provider::from_str(&row.provider)?,
        kind: CredentialKind::from_str(&row.kind)?,
        label: row.label,
        payload: Arc::new(SecretString::from(payload)),
        quarantined: row.quarantined != 0,
        quarantined_at: parse_ts_opt(row.quarantined_at)?,
        failure_count: row.failure_count as u32,
        last_used_at: parse_ts_opt(row.last_used_at)?,
        cooldown_until: parse_ts_opt(row.cooldown_until)?,
        added_at: parse_ts(&row.added_at)?,
    })
}

/// Загружает все сохранённые учётные данные для гидратации пула при старте
pub fn load_credentials(conn: &DbConnection) -> Result<Vec<StoredCredential>> {
    let mut stmt = conn.prepare(
        "SELECT id, provider, kind, label, payload, quarantined, quarantined_at, failure_count, last_used_at, cooldown_until, added_at
         FROM credentials
         ORDER BY added_at ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(CredentialRow {
            id: row.get(0)?,
            provider: row.get(1)?,
            kind: row.get(2)?,
            label: row.get(3)?,
            payload: row.get(4)?,
            quarantined: row.get(5)?,
            quarantined_at: row.get(6)?,
            failure_count: row.get(7)?,
            last_used_at: row.get(8)?,
            cooldown_until: row.get(9)?,
            added_at: row.get(10)?,
        })
    })?;

    let mut credentials = Vec::new();
    for row in rows {
        match decode_credential(row?) {
            Ok(credential) => credentials.push(credential),
            Err(e) => log::warn!("⚠️ Skipping unreadable credential row: {}", e),
        }
    }
    Ok(credentials)
}

/// Сохраняет задачу в БД (вставка или обновление жизненного цикла)
pub fn save_job(conn: &DbConnection, job: &Job) -> Result<()> {
    let id = job.id.to_string();
    let provider = job.provider.to_string();
    let url = job.url.to_string();
    let format = job.format.to_string();
    let state = job.state.to_string();
    let created_at = format_ts(&job.created_at);

    conn.execute(
        "INSERT INTO jobs (id, user_id, provider, url, format, quality, state, attempts, created_at, last_error, artifact_path)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
         state = excluded.state,
         attempts = excluded.attempts,
         last_error = excluded.last_error,
         artifact_path = excluded.artifact_path,
         updated_at = CURRENT_TIMESTAMP",
        &[
            &id as &dyn rusqlite::ToSql,
            &job.user_id as &dyn rusqlite::ToSql,
            &provider as &dyn rusqlite::ToSql,
            &url as &dyn rusqlite::ToSql,
            &format as &dyn rusqlite::ToSql,
            &job.quality as &dyn rusqlite::ToSql,
            &state as &dyn rusqlite::ToSql,
            &(job.attempts as i64) as &dyn rusqlite::ToSql,
            &created_at as &dyn rusqlite::ToSql,
            &job.last_error as &dyn rusqlite::ToSql,
            &job.artifact_path as &dyn rusqlite::ToSql,
        ],
    )?;
    Ok(())
}

/// Сырая строка таблицы jobs до декодирования
struct JobRow {
    id: String,
    user_id: i64,
    provider: String,
    url: String,
    format: String,
    quality: Option<String>,
    state: String,
    attempts: i64,
    created_at: String,
    last_error: Option<String>,
    artifact_path: Option<String>,
}

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        provider: row.get(2)?,
        url: row.get(3)?,
        format: row.get(4)?,
        quality: row.get(5)?,
        state: row.get(6)?,
        attempts: row.get(7)?,
        created_at: row.get(8)?,
        last_error: row.get(9)?,
        artifact_path: row.get(10)?,
    })
}

/// Восстанавливает типизированную задачу из сырой строки
fn decode_job(row: JobRow) -> anyhow::Result<Job> {
    Ok(Job {
        id: Uuid::parse_str(&row.id)?,
        user_id: row.user_id,
        provider: Provider::from_str(&row.provider)?,
        url: Url::parse(&row.url)?,
        format: MediaFormat::from_str(&row.format)?,
        quality: row.quality,
        state: JobState::from_str(&row.state)?,
        attempts: row.attempts as u32,
        created_at: parse_ts(&row.created_at)?,
        last_error: row.last_error,
        artifact_path: row.artifact_path,
    })
}

/// Получает задачу по идентификатору
pub fn get_job(conn: &DbConnection, job_id: Uuid) -> Result<Option<Job>> {
    let id = job_id.to_string();
    let mut stmt = conn.prepare(
        "SELECT id, user_id, provider, url, format, quality, state, attempts, created_at, last_error, artifact_path
         FROM jobs WHERE id = ?",
    )?;
    let mut rows = stmt.query(&[&id as &dyn rusqlite::ToSql])?;

    if let Some(row) = rows.next()? {
        match decode_job(read_job_row(row)?) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                log::warn!("⚠️ Unreadable job row {}: {}", id, e);
                Ok(None)
            }
        }
    } else {
        Ok(None)
    }
}

/// Возвращает задачи, прерванные рестартом, обратно в состояние ожидания.
/// Счётчик попыток сохраняется, поэтому бюджет повторов не сбрасывается.
pub fn requeue_interrupted_jobs(conn: &DbConnection) -> Result<usize> {
    let requeued = conn.execute(
        "UPDATE jobs SET state = 'queued', updated_at = CURRENT_TIMESTAMP WHERE state = 'running'",
        [],
    )?;
    Ok(requeued)
}

/// Загружает все ожидающие задачи в порядке поступления
pub fn load_pending_jobs(conn: &DbConnection) -> Result<Vec<Job>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, provider, url, format, quality, state, attempts, created_at, last_error, artifact_path
         FROM jobs
         WHERE state = 'queued'
         ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map([], read_job_row)?;

    let mut jobs = Vec::new();
    for row in rows {
        match decode_job(row?) {
            Ok(job) => jobs.push(job),
            Err(e) => log::warn!("⚠️ Skipping unreadable job row: {}", e),
        }
    }
    Ok(jobs)
}

/// Удаляет терминальные задачи старше окна хранения
pub fn purge_terminal_jobs(conn: &DbConnection, older_than: Duration) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::seconds(older_than.as_secs() as i64);
    let cutoff = format_ts(&cutoff);

    let purged = conn.execute(
        "DELETE FROM jobs WHERE state IN ('succeeded', 'failed', 'cancelled') AND updated_at <= ?1",
        &[&cutoff as &dyn rusqlite::ToSql],
    )?;
    if purged > 0 {
        log::debug!("Purged {} terminal job rows from the database", purged);
    }
    Ok(purged)
}
