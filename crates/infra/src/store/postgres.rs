//! Postgres-backed document store.
//!
//! Every mutation is a single conditional `UPDATE`, so compare-and-swap and
//! lease acquisition are atomic without explicit transactions. `NOW()` is the
//! store clock: ages and lease expiry never depend on the caller's clock.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Backend` (inserts use `ON CONFLICT`, so this is unexpected) |
//! | Database (serialization failure, deadlock) | `40001`, `40P01` | `Unavailable` |
//! | Database (connection exception) | `08xxx` | `Unavailable` |
//! | Database (other) | Any other | `Backend` |
//! | PoolTimedOut / PoolClosed / Io | N/A | `Unavailable` |
//! | ColumnDecode / Decode | N/A | `Corrupt` |
//! | Other | N/A | `Backend` |

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use docflow_core::{DocumentId, TenantId, UserId};
use docflow_documents::{
    Document, DocumentStatus, ErrorUpdate, LastError, Lease, LeaseToken, PayloadRef,
    ProcessingTrace, StatusUpdate,
};

use super::r#trait::{
    CasCondition, DocumentFilter, DocumentStore, LeaseAcquisition, LeaseRequest, StaleDocument,
    StaleQuery, StatusCounts, StoreError, TenantScope,
};

const SCHEMA: &str = include_str!("../../migrations/0001_documents.sql");

const DOCUMENT_COLUMNS: &str = "id, tenant_id, owner_id, filename, status, created_at, \
     last_modified_at, restart_allowed, retry_count, payload_ref, last_error, trace, \
     lease_token, lease_holder, lease_acquired_at, lease_expires_at, is_deleted";

/// Postgres-backed document store.
///
/// Every query filters out soft-deleted rows and compares statuses through
/// `UPPER(status)`, so rows written in any casing are matched.
#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: Arc<PgPool>,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `documents` table and its indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn current_lease(&self, id: DocumentId) -> Result<Option<Option<Lease>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT lease_token, lease_holder, lease_acquired_at, lease_expires_at,
                   (lease_expires_at > NOW()) AS active
            FROM documents
            WHERE id = $1 AND NOT is_deleted
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("current_lease", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let active: Option<bool> = row.try_get("active").map_err(decode_error)?;
        if !active.unwrap_or(false) {
            return Ok(Some(None));
        }
        Ok(Some(lease_from_columns(
            row.try_get("lease_token").map_err(decode_error)?,
            row.try_get("lease_holder").map_err(decode_error)?,
            row.try_get("lease_acquired_at").map_err(decode_error)?,
            row.try_get("lease_expires_at").map_err(decode_error)?,
        )))
    }
}

#[derive(Debug)]
struct DocumentRow {
    id: Uuid,
    tenant_id: Uuid,
    owner_id: Option<Uuid>,
    filename: String,
    status: String,
    created_at: DateTime<Utc>,
    last_modified_at: DateTime<Utc>,
    restart_allowed: bool,
    retry_count: i32,
    payload_ref: Option<String>,
    last_error: Option<Json<LastError>>,
    trace: Json<ProcessingTrace>,
    lease_token: Option<Uuid>,
    lease_holder: Option<String>,
    lease_acquired_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    is_deleted: bool,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DocumentRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(DocumentRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            owner_id: row.try_get("owner_id")?,
            filename: row.try_get("filename")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            last_modified_at: row.try_get("last_modified_at")?,
            restart_allowed: row.try_get("restart_allowed")?,
            retry_count: row.try_get("retry_count")?,
            payload_ref: row.try_get("payload_ref")?,
            last_error: row.try_get("last_error")?,
            trace: row.try_get("trace")?,
            lease_token: row.try_get("lease_token")?,
            lease_holder: row.try_get("lease_holder")?,
            lease_acquired_at: row.try_get("lease_acquired_at")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            is_deleted: row.try_get("is_deleted")?,
        })
    }
}

impl TryFrom<DocumentRow> for Document {
    type Error = StoreError;

    fn try_from(row: DocumentRow) -> Result<Self, StoreError> {
        let status = parse_status(&row.status)?;
        let retry_count = u32::try_from(row.retry_count).map_err(|_| {
            StoreError::Corrupt(format!(
                "document {} has negative retry_count {}",
                row.id, row.retry_count
            ))
        })?;

        Ok(Document {
            id: DocumentId::from_uuid(row.id),
            tenant_id: TenantId::from_uuid(row.tenant_id),
            owner: row.owner_id.map(UserId::from_uuid),
            filename: row.filename,
            status,
            created_at: row.created_at,
            last_modified_at: row.last_modified_at,
            restart_allowed: row.restart_allowed,
            retry_count,
            payload_ref: row.payload_ref.map(PayloadRef),
            last_error: row.last_error.map(|j| j.0),
            trace: row.trace.0,
            lease: lease_from_columns(
                row.lease_token,
                row.lease_holder,
                row.lease_acquired_at,
                row.lease_expires_at,
            ),
            deleted: row.is_deleted,
        })
    }
}

fn parse_status(raw: &str) -> Result<DocumentStatus, StoreError> {
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("unknown document status {raw:?}")))
}

fn lease_from_columns(
    token: Option<Uuid>,
    holder: Option<String>,
    acquired_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
) -> Option<Lease> {
    Some(Lease {
        token: LeaseToken::from_uuid(token?),
        holder: holder.unwrap_or_default(),
        acquired_at: acquired_at?,
        expires_at: expires_at?,
    })
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Corrupt(format!("failed to decode column: {err}"))
}

fn status_names(statuses: impl IntoIterator<Item = DocumentStatus>) -> Vec<String> {
    statuses.into_iter().map(|s| s.as_str().to_string()).collect()
}

#[async_trait::async_trait]
impl DocumentStore for PostgresDocumentStore {
    async fn now(&self) -> Result<DateTime<Utc>, StoreError> {
        let row = sqlx::query("SELECT NOW() AS now")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("now", e))?;
        row.try_get("now").map_err(decode_error)
    }

    #[instrument(skip(self), fields(document_id = %id), err)]
    async fn get(&self, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let sql = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1 AND NOT is_deleted");
        let row = sqlx::query_as::<_, DocumentRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(Document::try_from).transpose()
    }

    #[instrument(skip(self, document), fields(document_id = %document.id, tenant_id = %document.tenant_id), err)]
    async fn insert(&self, document: Document) -> Result<(), StoreError> {
        document
            .validate()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let retry_count = i32::try_from(document.retry_count)
            .map_err(|_| StoreError::Corrupt("retry_count out of range".to_string()))?;

        let result = sqlx::query(
            r#"
            INSERT INTO documents (
                id, tenant_id, owner_id, filename, status, created_at, last_modified_at,
                restart_allowed, retry_count, payload_ref, last_error, trace
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(document.id.as_uuid())
        .bind(document.tenant_id.as_uuid())
        .bind(document.owner.map(Uuid::from))
        .bind(&document.filename)
        .bind(document.status.as_str())
        .bind(document.created_at)
        .bind(document.last_modified_at)
        .bind(document.restart_allowed)
        .bind(retry_count)
        .bind(document.payload_ref.as_ref().map(|p| p.0.as_str()))
        .bind(document.last_error.clone().map(Json))
        .bind(Json(document.trace.clone()))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(document.id));
        }
        Ok(())
    }

    #[instrument(
        skip(self, update),
        fields(
            document_id = %id,
            expected = %condition.expected_status,
            next = %update.status,
            leased = condition.lease_token.is_some()
        ),
        err
    )]
    async fn cas_update(
        &self,
        id: DocumentId,
        condition: CasCondition,
        update: &StatusUpdate,
    ) -> Result<bool, StoreError> {
        let retry_count = update
            .retry_count
            .map(i32::try_from)
            .transpose()
            .map_err(|_| StoreError::Corrupt("retry_count out of range".to_string()))?;
        let (replace_error, new_error) = match &update.last_error {
            ErrorUpdate::Keep => (false, None),
            ErrorUpdate::Set(e) => (true, Some(Json(e.clone()))),
        };

        let result = sqlx::query(
            r#"
            UPDATE documents SET
                status = $3,
                last_modified_at = GREATEST(last_modified_at, NOW()),
                retry_count = COALESCE($4, retry_count),
                restart_allowed = COALESCE($5, restart_allowed),
                last_error = CASE WHEN $6 THEN $7 ELSE last_error END
            WHERE id = $1
                AND NOT is_deleted
                AND UPPER(status) = $2
                AND ($8::uuid IS NULL OR (lease_token = $8 AND lease_expires_at > NOW()))
            "#,
        )
        .bind(id.as_uuid())
        .bind(condition.expected_status.as_str())
        .bind(update.status.as_str())
        .bind(retry_count)
        .bind(update.restart_allowed)
        .bind(replace_error)
        .bind(new_error)
        .bind(condition.lease_token.map(|t| *t.as_uuid()))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("cas_update", e))?;

        let applied = result.rows_affected() == 1;
        debug!(applied, "cas_update");
        Ok(applied)
    }

    #[instrument(skip(self, request), fields(document_id = %id, token = %request.token), err)]
    async fn try_acquire_lease(
        &self,
        id: DocumentId,
        request: &LeaseRequest,
    ) -> Result<LeaseAcquisition, StoreError> {
        let ttl_secs = request.ttl.num_milliseconds() as f64 / 1000.0;

        let row = sqlx::query(
            r#"
            UPDATE documents SET
                lease_token = $2,
                lease_holder = $3,
                lease_acquired_at = CASE
                    WHEN lease_token = $2 AND lease_expires_at > NOW() THEN lease_acquired_at
                    ELSE NOW() END,
                lease_expires_at = CASE
                    WHEN lease_token = $2 AND lease_expires_at > NOW() THEN lease_expires_at
                    ELSE NOW() + make_interval(secs => $4) END
            WHERE id = $1
                AND NOT is_deleted
                AND (lease_token IS NULL OR lease_expires_at <= NOW() OR lease_token = $2)
            RETURNING lease_token, lease_holder, lease_acquired_at, lease_expires_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(request.token.as_uuid())
        .bind(&request.holder)
        .bind(ttl_secs)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("try_acquire_lease", e))?;

        if let Some(row) = row {
            let lease = lease_from_columns(
                row.try_get("lease_token").map_err(decode_error)?,
                row.try_get("lease_holder").map_err(decode_error)?,
                row.try_get("lease_acquired_at").map_err(decode_error)?,
                row.try_get("lease_expires_at").map_err(decode_error)?,
            )
            .ok_or_else(|| StoreError::Corrupt("lease columns missing after acquire".into()))?;
            return Ok(LeaseAcquisition::Acquired(lease));
        }

        match self.current_lease(id).await? {
            None => Ok(LeaseAcquisition::NotFound),
            Some(Some(lease)) => Ok(LeaseAcquisition::Conflict(lease)),
            // The holder released between our two statements.
            Some(None) => Err(StoreError::Unavailable(
                "lease state changed during acquisition".to_string(),
            )),
        }
    }

    #[instrument(skip(self), fields(document_id = %id, token = %token), err)]
    async fn release_lease(&self, id: DocumentId, token: LeaseToken) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE documents SET
                lease_token = NULL,
                lease_holder = NULL,
                lease_acquired_at = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND lease_token = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(token.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release_lease", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, query), fields(statuses = query.thresholds.len()), err)]
    async fn query_by_status_age(
        &self,
        query: &StaleQuery,
    ) -> Result<Vec<StaleDocument>, StoreError> {
        let statuses = status_names(query.thresholds.iter().map(|(s, _)| *s));
        let thresholds_ms: Vec<i64> = query
            .thresholds
            .iter()
            .map(|(_, t)| t.num_milliseconds())
            .collect();

        let rows = sqlx::query(
            r#"
            SELECT
                d.id,
                d.tenant_id,
                UPPER(d.status) AS status,
                d.last_modified_at,
                (EXTRACT(EPOCH FROM (NOW() - d.last_modified_at)) * 1000)::BIGINT AS age_ms,
                COALESCE(d.lease_token IS NOT NULL AND d.lease_expires_at > NOW(), FALSE) AS leased
            FROM documents d
            JOIN UNNEST($1::text[], $2::bigint[]) AS t(status, threshold_ms)
                ON UPPER(d.status) = t.status
            WHERE NOT d.is_deleted
                AND ($3::uuid IS NULL OR d.tenant_id = $3)
                AND d.last_modified_at < NOW() - (t.threshold_ms * INTERVAL '1 millisecond')
            ORDER BY d.last_modified_at ASC, d.id ASC
            LIMIT $4
            "#,
        )
        .bind(statuses)
        .bind(thresholds_ms)
        .bind(query.scope.tenant().map(Uuid::from))
        .bind(query.limit.map(|l| l as i64))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("query_by_status_age", e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let age_ms: i64 = row.try_get("age_ms").map_err(decode_error)?;
            out.push(StaleDocument {
                id: DocumentId::from_uuid(row.try_get("id").map_err(decode_error)?),
                tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(decode_error)?),
                status: parse_status(&status)?,
                last_modified_at: row.try_get("last_modified_at").map_err(decode_error)?,
                age: Duration::milliseconds(age_ms),
                leased: row.try_get("leased").map_err(decode_error)?,
            });
        }
        Ok(out)
    }

    #[instrument(skip(self), err)]
    async fn status_counts(&self, scope: TenantScope) -> Result<StatusCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT UPPER(status) AS status, COUNT(*) AS n
            FROM documents
            WHERE NOT is_deleted AND ($1::uuid IS NULL OR tenant_id = $1)
            GROUP BY UPPER(status)
            "#,
        )
        .bind(scope.tenant().map(Uuid::from))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("status_counts", e))?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status").map_err(decode_error)?;
            let n: i64 = row.try_get("n").map_err(decode_error)?;
            counts.push((parse_status(&status)?, n.max(0) as u64));
        }
        Ok(counts.into_iter().collect())
    }

    #[instrument(skip(self, filter), err)]
    async fn list_documents(&self, filter: &DocumentFilter) -> Result<Vec<Document>, StoreError> {
        let sql = format!(
            r#"
            SELECT {DOCUMENT_COLUMNS}
            FROM documents
            WHERE NOT is_deleted
                AND ($1::uuid IS NULL OR tenant_id = $1)
                AND (cardinality($2::text[]) = 0 OR UPPER(status) = ANY($2))
                AND ($3::uuid[] IS NULL OR id = ANY($3))
                AND ($4::timestamptz IS NULL OR last_modified_at >= $4)
            ORDER BY last_modified_at DESC, id DESC
            LIMIT $5
            "#
        );
        let ids: Option<Vec<Uuid>> = filter
            .ids
            .as_ref()
            .map(|ids| ids.iter().map(|id| *id.as_uuid()).collect());

        let rows = sqlx::query_as::<_, DocumentRow>(&sql)
            .bind(filter.scope.tenant().map(Uuid::from))
            .bind(status_names(filter.statuses.iter().copied()))
            .bind(ids)
            .bind(filter.modified_since)
            .bind(filter.limit.map(|l| l as i64))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_documents", e))?;

        rows.into_iter().map(Document::try_from).collect()
    }
}

/// Map SQLx errors to `StoreError`.
///
/// Connection-level trouble is `Unavailable` (retryable); anything that
/// indicates bad data or a bad query is surfaced as-is.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Backend(format!("unique violation in {operation}")),
                Some("40001") | Some("40P01") => StoreError::Unavailable(msg),
                Some(code) if code.starts_with("08") => StoreError::Unavailable(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(format!("{operation}: {err}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(format!("{operation}: {err}"))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_lowercase_statuses_parse() {
        assert_eq!(parse_status("restarted").unwrap(), DocumentStatus::Restarted);
        assert_eq!(
            parse_status("ready_for_validation").unwrap(),
            DocumentStatus::ReadyForValidation
        );
        assert!(matches!(parse_status("bogus"), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn partial_lease_columns_mean_no_lease() {
        let now = Utc::now();
        assert!(lease_from_columns(None, None, Some(now), Some(now)).is_none());
        assert!(lease_from_columns(Some(Uuid::now_v7()), None, Some(now), None).is_none());

        let lease = lease_from_columns(Some(Uuid::now_v7()), Some("c1".into()), Some(now), Some(now))
            .unwrap();
        assert_eq!(lease.holder, "c1");
    }

    #[test]
    fn pool_exhaustion_is_retryable() {
        assert!(map_sqlx_error("get", sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!map_sqlx_error("get", sqlx::Error::RowNotFound).is_retryable());
    }

    #[test]
    fn negative_retry_count_is_corrupt() {
        let now = Utc::now();
        let row = DocumentRow {
            id: Uuid::now_v7(),
            tenant_id: Uuid::now_v7(),
            owner_id: None,
            filename: "a.pdf".into(),
            status: "error".into(),
            created_at: now,
            last_modified_at: now,
            restart_allowed: true,
            retry_count: -1,
            payload_ref: None,
            last_error: None,
            trace: Json(ProcessingTrace::default()),
            lease_token: None,
            lease_holder: None,
            lease_acquired_at: None,
            lease_expires_at: None,
            is_deleted: false,
        };
        assert!(matches!(Document::try_from(row), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn selected_columns_match_row_decoding() {
        let selected: Vec<&str> = DOCUMENT_COLUMNS.split(',').map(str::trim).collect();
        assert_eq!(
            selected,
            [
                "id",
                "tenant_id",
                "owner_id",
                "filename",
                "status",
                "created_at",
                "last_modified_at",
                "restart_allowed",
                "retry_count",
                "payload_ref",
                "last_error",
                "trace",
                "lease_token",
                "lease_holder",
                "lease_acquired_at",
                "lease_expires_at",
                "is_deleted",
            ]
        );
    }
}
