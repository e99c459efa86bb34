use crate::constants::DB_PRAGMAS;
use crate::types::{RelayError, Result, Sender, Turn};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;

pub type DbPool = SqlitePool;

pub async fn init_db<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    let path_str = match path.as_ref().to_str() {
        Some(s) => s,
        None => {
            return Err(RelayError::Internal(
                "Invalid database path: Path contains non-UTF8 characters".to_string(),
                tracing_error::SpanTrace::capture(),
            )
            .into())
        }
    };
    let url = format!("sqlite:{}?mode=rwc", path_str);

    let pool = match SqlitePool::connect(&url).await {
        Ok(p) => p,
        Err(e) => return Err(RelayError::Database(e).into()),
    };

    configure_db(&pool).await?;

    if let Err(e) = sqlx::migrate!("./migrations").run(&pool).await {
        return Err(RelayError::Internal(
            format!("Migration failed: {}", e),
            tracing_error::SpanTrace::capture(),
        )
        .into());
    }

    verify_schema_version(&pool).await;

    Ok(pool)
}

async fn configure_db(pool: &DbPool) -> Result<()> {
    for pragma in DB_PRAGMAS {
        if let Err(e) = sqlx::query(pragma).execute(pool).await {
            return Err(RelayError::Database(e).into());
        }
    }
    Ok(())
}

async fn verify_schema_version(pool: &DbPool) {
    let version_row: std::result::Result<(String,), sqlx::Error> =
        sqlx::query_as("SELECT value FROM schema_metadata WHERE key = 'schema_version'")
            .fetch_one(pool)
            .await;

    match version_row {
        Ok((version,)) => {
            tracing::info!("Database initialized. Schema version: {}", version);
        }
        Err(e) => {
            tracing::warn!("Could not verify schema version: {}", e);
        }
    }
}

/// Handle to the conversation log. Cheap to clone; all clones share one pool.
#[derive(Clone, Debug)]
pub struct ConversationStore {
    pool: DbPool,
}

impl ConversationStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, sender: Sender, text: &str) -> Result<Turn> {
        if text.trim().is_empty() {
            return Err(RelayError::Validation(format!(
                "Refusing to store an empty {} turn",
                sender
            ))
            .into());
        }

        let created_at = Utc::now();
        let result = sqlx::query("INSERT INTO turns (sender, text, created_at) VALUES (?, ?, ?)")
            .bind(sender.as_str())
            .bind(text)
            .bind(created_at.to_rfc3339())
            .execute(&self.pool)
            .await?;

        let turn = Turn {
            id: result.last_insert_rowid(),
            sender,
            text: text.to_string(),
            created_at,
        };
        tracing::debug!(
            "[⚙️  -> 💾] Stored {} turn #{} ({} chars)",
            turn.sender,
            turn.id,
            turn.text.chars().count()
        );
        Ok(turn)
    }

    /// Every turn in conversation order.
    pub async fn all(&self) -> Result<Vec<Turn>> {
        let rows = sqlx::query("SELECT id, sender, text, created_at FROM turns ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(turn_from_row).collect()
    }

    /// The last `limit` turns, oldest first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<Turn>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT id, sender, text, created_at FROM \
             (SELECT id, sender, text, created_at FROM turns ORDER BY id DESC LIMIT ?) \
             ORDER BY id ASC",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(turn_from_row).collect()
    }

    pub async fn count(&self, sender: Sender) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM turns WHERE sender = ?")
            .bind(sender.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Deletes every turn of both kinds. Returns the number removed.
    pub async fn clear(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM turns").execute(&self.pool).await?;
        tracing::info!(
            "[⚙️  -> 💾] Conversation cleared ({} turns removed)",
            deleted.rows_affected()
        );
        Ok(deleted.rows_affected())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}

fn turn_from_row(row: &SqliteRow) -> Result<Turn> {
    let sender: String = row.try_get("sender")?;
    let created_at: String = row.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| {
            RelayError::Internal(
                format!("Invalid created_at '{}': {}", created_at, e),
                tracing_error::SpanTrace::capture(),
            )
        })?
        .with_timezone(&Utc);

    Ok(Turn {
        id: row.try_get("id")?,
        sender: sender.parse()?,
        text: row.try_get("text")?,
        created_at,
    })
}
