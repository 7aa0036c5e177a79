use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tollgate_core::hitl::{ConversationScope, HitlPayload, HitlRequest, InteractionType, RequestStatus};
use tollgate_core::store::{cancellation_payload, RequestStore, StoreError};

const SELECT_COLUMNS: &str = "id, interaction_type, conversation_id, tenant_id, project_id,
     payload, status, response, created_at, expires_at";

/// Raw column values of one `hitl_requests` row.
type RequestRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
    i64,
);

/// SQLite-based HITL request storage
///
/// Requests survive a process restart, so a recovered process can list
/// what is still waiting on a human.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use tollgate_core::events::NoopEmitter;
/// use tollgate_core::hitl::{ConversationScope, HitlCoordinator, RequestDirectory};
/// use tollgate_sqlite::SqliteRequestStore;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = SqliteRequestStore::new(".tollgate/requests.db")?;
/// let coordinator = HitlCoordinator::builder(ConversationScope::new("conv-1", "tenant", "project"))
///     .with_store(Arc::new(store))
///     .with_emitter(Arc::new(NoopEmitter))
///     .with_directory(RequestDirectory::shared())
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct SqliteRequestStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRequestStore {
    /// Create new SQLite store at path
    ///
    /// Creates database file and tables if they don't exist.
    /// Path can be relative or absolute.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Storage(format!("Failed to create directory: {}", e)))?;
        }

        let conn = Connection::open(&path)
            .map_err(|e| StoreError::Storage(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    /// Store backed by a private in-memory database.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Storage(format!("Failed to open database: {}", e)))?;
        Self::with_connection(conn)
    }

    /// Use default location (.tollgate/requests.db in current directory)
    pub fn default_location() -> Result<Self, StoreError> {
        Self::new(".tollgate/requests.db")
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(include_str!("schema.sql"))
            .map_err(|e| StoreError::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Mark pending requests past their expiry as timed out.
    ///
    /// Returns how many were swept. A restarted process calls this before
    /// listing pending work, since no waiter is left to time them out.
    pub fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn.lock();
        let swept = conn
            .execute(
                "UPDATE hitl_requests SET status = ?, settled_at = ?
                 WHERE status = ? AND expires_at <= ?",
                params![
                    RequestStatus::TimedOut.as_str(),
                    now.timestamp_millis(),
                    RequestStatus::Pending.as_str(),
                    now.timestamp_millis(),
                ],
            )
            .map_err(storage)?;
        if swept > 0 {
            debug!("Expired {} overdue request(s)", swept);
        }
        Ok(swept)
    }

    /// Move a pending request to `status`. False if unknown or settled.
    fn transition(
        &self,
        id: &str,
        status: RequestStatus,
        response: Option<&Value>,
    ) -> Result<bool, StoreError> {
        let response = response.map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock();
        let rows = conn
            .execute(
                "UPDATE hitl_requests SET status = ?, response = ?, settled_at = ?
                 WHERE id = ? AND status = ?",
                params![
                    status.as_str(),
                    response,
                    Utc::now().timestamp_millis(),
                    id,
                    RequestStatus::Pending.as_str(),
                ],
            )
            .map_err(storage)?;
        Ok(rows == 1)
    }
}

fn storage(e: rusqlite::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RequestRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn timestamp(millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Storage(format!("Invalid timestamp {}", millis)))
}

fn into_request(row: RequestRow) -> Result<HitlRequest, StoreError> {
    let (
        id,
        interaction_type,
        conversation_id,
        tenant_id,
        project_id,
        payload,
        status,
        response,
        created_at,
        expires_at,
    ) = row;

    let interaction_type = InteractionType::from_str(&interaction_type)
        .map_err(|e| StoreError::Storage(e.to_string()))?;
    let status = RequestStatus::from_str(&status).map_err(StoreError::Storage)?;
    let payload: HitlPayload = serde_json::from_str(&payload)?;
    let response = response
        .as_deref()
        .map(serde_json::from_str::<Value>)
        .transpose()?;

    Ok(HitlRequest {
        id,
        interaction_type,
        scope: ConversationScope::new(conversation_id, tenant_id, project_id),
        payload,
        status,
        response,
        created_at: timestamp(created_at)?,
        expires_at: timestamp(expires_at)?,
    })
}

#[async_trait]
impl RequestStore for SqliteRequestStore {
    async fn create(&self, request: &HitlRequest) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&request.payload)?;
        let response = request
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock();
        let result = conn.execute(
            "INSERT INTO hitl_requests (id, interaction_type, conversation_id, tenant_id,
                 project_id, payload, status, response, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                request.id,
                request.interaction_type.as_str(),
                request.scope.conversation_id,
                request.scope.tenant_id,
                request.scope.project_id,
                payload,
                request.status.as_str(),
                response,
                request.created_at.timestamp_millis(),
                request.expires_at.timestamp_millis(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::Duplicate(request.id.clone()))
            }
            Err(e) => Err(StoreError::Storage(format!("Failed to insert request: {}", e))),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<HitlRequest>, StoreError> {
        let row = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {} FROM hitl_requests WHERE id = ?", SELECT_COLUMNS),
                params![id],
                read_row,
            )
            .optional()
            .map_err(storage)?
        };

        row.map(into_request).transpose()
    }

    async fn mark_answered(&self, id: &str, response: &Value) -> Result<bool, StoreError> {
        self.transition(id, RequestStatus::Answered, Some(response))
    }

    async fn mark_timed_out(&self, id: &str) -> Result<bool, StoreError> {
        self.transition(id, RequestStatus::TimedOut, None)
    }

    async fn mark_cancelled(&self, id: &str, reason: Option<&str>) -> Result<bool, StoreError> {
        self.transition(
            id,
            RequestStatus::Cancelled,
            Some(&cancellation_payload(reason)),
        )
    }

    async fn list_pending(&self, conversation_id: &str) -> Result<Vec<HitlRequest>, StoreError> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM hitl_requests
                     WHERE conversation_id = ? AND status = ?
                     ORDER BY created_at, id",
                    SELECT_COLUMNS
                ))
                .map_err(storage)?;
            let rows = stmt
                .query_map(
                    params![conversation_id, RequestStatus::Pending.as_str()],
                    read_row,
                )
                .map_err(storage)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(storage)?;
            rows
        };

        rows.into_iter().map(into_request).collect()
    }
}
