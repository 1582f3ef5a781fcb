//! Financial request rows

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use super::models::{current_timestamp, Request, RequestStatus, RequestType};
use crate::error::EngineError;
use crate::money::Money;

/// Input for creating a request; the assignee is chosen before insert
#[derive(Debug, Clone)]
pub struct NewRequest<'a> {
    pub request_type: RequestType,
    pub user_id: &'a str,
    pub amount: Money,
    pub assigned_admin_id: &'a str,
    pub metadata_json: Option<String>,
}

/// Filters for listing requests; camelCase when read from JSON
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestQuery {
    #[serde(default)]
    pub assigned_admin_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub status: Option<RequestStatus>,
    #[serde(default)]
    pub request_type: Option<RequestType>,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 { 100 }

impl Default for RequestQuery {
    fn default() -> Self {
        Self {
            assigned_admin_id: None,
            user_id: None,
            status: None,
            request_type: None,
            limit: default_limit(),
            offset: 0,
        }
    }
}

fn request_from_row(row: &Row) -> Result<Request, rusqlite::Error> {
    Ok(Request {
        id: row.get("id")?,
        request_type: row.get("request_type")?,
        user_id: row.get("user_id")?,
        amount: row.get("amount")?,
        status: row.get("status")?,
        assigned_admin_id: row.get("assigned_admin_id")?,
        created_at: row.get("created_at")?,
        processed_at: row.get("processed_at")?,
        processed_by: row.get("processed_by")?,
        admin_notes: row.get("admin_notes")?,
        metadata_json: row.get("metadata_json")?,
    })
}

pub fn insert_request(conn: &Connection, input: &NewRequest<'_>) -> Result<Request, EngineError> {
    let id = Uuid::new_v4().to_string();

    conn.execute(
        "INSERT INTO requests
            (id, request_type, user_id, amount, status, assigned_admin_id, created_at, metadata_json)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7)",
        params![
            id,
            input.request_type,
            input.user_id,
            input.amount,
            input.assigned_admin_id,
            current_timestamp(),
            input.metadata_json,
        ],
    )?;

    debug!(request_id = %id, admin_id = %input.assigned_admin_id, "Inserted request");
    require_request(conn, &id)
}

pub fn get_request(conn: &Connection, id: &str) -> Result<Option<Request>, EngineError> {
    Ok(conn
        .query_row("SELECT * FROM requests WHERE id = ?1", params![id], request_from_row)
        .optional()?)
}

pub fn require_request(conn: &Connection, id: &str) -> Result<Request, EngineError> {
    get_request(conn, id)?.ok_or_else(|| EngineError::RequestNotFound(id.to_string()))
}

/// Move a pending request to a terminal status in one conditional write.
///
/// Returns false when the request was no longer pending.
pub fn resolve_request(
    conn: &Connection,
    id: &str,
    status: RequestStatus,
    admin_id: &str,
    notes: Option<&str>,
) -> Result<bool, EngineError> {
    if !status.is_terminal() {
        return Err(EngineError::InvalidInput("A request can only resolve to a terminal status".into()));
    }

    let updated = conn.execute(
        "UPDATE requests
         SET status = ?1, processed_at = ?2, processed_by = ?3, admin_notes = ?4
         WHERE id = ?5 AND status = 'pending'",
        params![status, current_timestamp(), admin_id, notes, id],
    )?;
    Ok(updated == 1)
}

/// List requests with optional filters, oldest first
pub fn list_requests(conn: &Connection, query: &RequestQuery) -> Result<Vec<Request>, EngineError> {
    let mut sql = String::from("SELECT * FROM requests");
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![];
    let mut conditions = vec![];

    if let Some(ref admin_id) = query.assigned_admin_id {
        conditions.push("assigned_admin_id = ?");
        params.push(Box::new(admin_id.clone()));
    }

    if let Some(ref user_id) = query.user_id {
        conditions.push("user_id = ?");
        params.push(Box::new(user_id.clone()));
    }

    if let Some(status) = query.status {
        conditions.push("status = ?");
        params.push(Box::new(status));
    }

    if let Some(request_type) = query.request_type {
        conditions.push("request_type = ?");
        params.push(Box::new(request_type));
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    sql.push_str(" ORDER BY created_at ASC, id ASC LIMIT ? OFFSET ?");
    params.push(Box::new(query.limit as i64));
    params.push(Box::new(query.offset as i64));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

    let requests = stmt
        .query_map(param_refs.as_slice(), request_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{admins, users, AdminLevel, EngineDb};

    fn setup() -> EngineDb {
        let db = EngineDb::open_in_memory().unwrap();
        db.with_tx(|tx| {
            users::create_user(tx, "alice")?;
            admins::create_admin(tx, "a1", AdminLevel::Low, true)?;
            admins::create_admin(tx, "a2", AdminLevel::Low, true)?;
            Ok(())
        })
        .unwrap();
        db
    }

    fn insert(db: &EngineDb, request_type: RequestType, admin: &str) -> Request {
        db.with_tx(|tx| {
            insert_request(tx, &NewRequest {
                request_type,
                user_id: "alice",
                amount: Money::from_cents(1_000),
                assigned_admin_id: admin,
                metadata_json: None,
            })
        })
        .unwrap()
    }

    #[test]
    fn test_resolve_is_conditional_on_pending() {
        let db = setup();
        let request = insert(&db, RequestType::Withdrawal, "a1");
        assert_eq!(request.status, RequestStatus::Pending);

        let first = db
            .with_tx(|tx| resolve_request(tx, &request.id, RequestStatus::Approved, "a1", None))
            .unwrap();
        let second = db
            .with_tx(|tx| resolve_request(tx, &request.id, RequestStatus::Rejected, "a1", Some("late")))
            .unwrap();
        assert!(first);
        assert!(!second);

        let stored = db.with_conn(|conn| require_request(conn, &request.id)).unwrap();
        assert_eq!(stored.status, RequestStatus::Approved);
        assert!(stored.admin_notes.is_none());
    }

    #[test]
    fn test_resolve_rejects_pending_target() {
        let db = setup();
        let request = insert(&db, RequestType::Purchase, "a1");
        let err = db
            .with_tx(|tx| resolve_request(tx, &request.id, RequestStatus::Pending, "a1", None))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[test]
    fn test_list_filters() {
        let db = setup();
        insert(&db, RequestType::Purchase, "a1");
        let done = insert(&db, RequestType::Upgrade, "a1");
        insert(&db, RequestType::Purchase, "a2");
        db.with_tx(|tx| resolve_request(tx, &done.id, RequestStatus::Rejected, "a1", None))
            .unwrap();

        let query = RequestQuery {
            assigned_admin_id: Some("a1".into()),
            ..Default::default()
        };
        assert_eq!(db.with_conn(|conn| list_requests(conn, &query)).unwrap().len(), 2);

        let query = RequestQuery {
            assigned_admin_id: Some("a1".into()),
            status: Some(RequestStatus::Pending),
            ..Default::default()
        };
        let pending = db.with_conn(|conn| list_requests(conn, &query)).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_type, RequestType::Purchase);

        let query = RequestQuery { limit: 1, ..Default::default() };
        assert_eq!(db.with_conn(|conn| list_requests(conn, &query)).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_request() {
        let db = setup();
        let err = db.with_conn(|conn| require_request(conn, "nope")).unwrap_err();
        assert!(matches!(err, EngineError::RequestNotFound(_)));
    }
}
