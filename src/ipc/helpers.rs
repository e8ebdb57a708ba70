use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

use crate::ipc::error::err;

/// Handler-level failure, rendered into the wire error object by the
/// dispatching function. `code` values map one-to-one onto the protocol's
/// error taxonomy (bad_params, not_found, batch_empty, db_*).
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn bad_params(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        HandlerErr {
            code: "not_found",
            message: message.into(),
            details: None,
        }
    }

    pub fn db(code: &'static str, e: impl ToString) -> Self {
        HandlerErr {
            code,
            message: e.to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

pub fn get_opt_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn today() -> String {
    chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()
}

/// Parse a `YYYY-MM-DD` value, normalizing whatever the caller sent down to
/// day granularity for natural-key purposes.
pub fn parse_day(raw: &str) -> Result<String, HandlerErr> {
    let t = raw.trim();
    // Accept a full RFC 3339 timestamp by truncating to its date part.
    let date_part = t.split('T').next().unwrap_or(t);
    let parsed = NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .map_err(|_| HandlerErr::bad_params(format!("invalid date: {}", raw)))?;
    Ok(parsed.format("%Y-%m-%d").to_string())
}

/// A course reference resolved once at the request boundary: either a
/// catalogued course (by id, with its name denormalized alongside) or a
/// free-form course name with no catalogue entry behind it.
pub enum CourseRef {
    ById { id: String, name: String },
    ByName { name: String },
}

impl CourseRef {
    /// Resolve from request params. `courseId` wins and must exist;
    /// otherwise a non-empty `courseName` is required.
    pub fn resolve(
        conn: &Connection,
        course_id: Option<&str>,
        course_name: Option<&str>,
    ) -> Result<CourseRef, HandlerErr> {
        if let Some(id) = course_id {
            let name: Option<String> = conn
                .query_row("SELECT name FROM courses WHERE id = ?", [id], |r| r.get(0))
                .optional()
                .map_err(|e| HandlerErr::db("db_query_failed", e))?;
            let Some(name) = name else {
                return Err(HandlerErr::not_found("course not found")
                    .with_details(json!({ "courseId": id })));
            };
            return Ok(CourseRef::ById {
                id: id.to_string(),
                name,
            });
        }
        match course_name.map(str::trim) {
            Some(name) if !name.is_empty() => Ok(CourseRef::ByName {
                name: name.to_string(),
            }),
            _ => Err(HandlerErr::bad_params("missing courseId or courseName")),
        }
    }

    /// The value that backs the UNIQUE (student, course, day) natural key.
    pub fn key(&self) -> &str {
        match self {
            CourseRef::ById { id, .. } => id,
            CourseRef::ByName { name } => name,
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            CourseRef::ById { id, .. } => Some(id),
            CourseRef::ByName { .. } => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CourseRef::ById { name, .. } => name,
            CourseRef::ByName { name } => name,
        }
    }
}

pub fn user_exists(conn: &Connection, user_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM users WHERE id = ?", [user_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

pub fn course_exists(conn: &Connection, course_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}
