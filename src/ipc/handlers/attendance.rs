use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_opt_str, get_required_str, now_rfc3339, parse_day, today, user_exists, CourseRef,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::stats::{self, AttendanceStatus};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Write one attendance row for the (student, course, day) natural key.
/// A second submission for the same key updates status/justification in
/// place and leaves the original creation metadata untouched.
fn upsert_attendance(
    conn: &Connection,
    student_id: &str,
    course: &CourseRef,
    day: &str,
    status: AttendanceStatus,
    justification: Option<&str>,
    recorded_by: &str,
) -> Result<String, HandlerErr> {
    let attendance_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO attendance(id, student_id, course_id, course_key, course_name,
                                day, status, justification, recorded_by, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, course_key, day) DO UPDATE SET
           status = excluded.status,
           justification = excluded.justification,
           updated_at = excluded.updated_at",
        (
            &attendance_id,
            student_id,
            course.id(),
            course.key(),
            course.name(),
            day,
            status.as_str(),
            justification,
            recorded_by,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "attendance" })))?;

    // The conflict path keeps the existing row id, so read the key back.
    conn.query_row(
        "SELECT id FROM attendance WHERE student_id = ? AND course_key = ? AND day = ?",
        (student_id, course.key(), day),
        |r| r.get(0),
    )
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn record_batch(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let course = CourseRef::resolve(conn, Some(course_id.as_str()), None)?;

    let day = match get_opt_str(params, "day") {
        Some(raw) => parse_day(&raw)?,
        None => today(),
    };
    let recorded_by = get_opt_str(params, "recordedBy").unwrap_or_default();

    let Some(items) = params.get("items").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("items must be an array"));
    };
    if items.is_empty() {
        return Err(HandlerErr::bad_params("items must not be empty"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    let mut records: Vec<serde_json::Value> = Vec::new();
    let mut errors: Vec<serde_json::Value> = Vec::new();

    // Items are applied strictly in order: two entries for the same student
    // in one batch must resolve to one row, last writer wins.
    for (i, item) in items.iter().enumerate() {
        let Some(obj) = item.as_object() else {
            errors.push(json!({
                "studentId": serde_json::Value::Null,
                "error": format!("item at index {} must be an object", i),
            }));
            continue;
        };

        let student_id = match obj.get("studentId").and_then(|v| v.as_str()).map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => {
                errors.push(json!({
                    "studentId": serde_json::Value::Null,
                    "error": format!("item at index {} missing studentId", i),
                }));
                continue;
            }
        };

        let status = match obj.get("status").and_then(|v| v.as_str()) {
            Some(raw) => match AttendanceStatus::parse(raw) {
                Some(s) => s,
                None => {
                    errors.push(json!({
                        "studentId": student_id,
                        "error": format!("invalid status: {}", raw),
                    }));
                    continue;
                }
            },
            None => {
                errors.push(json!({
                    "studentId": student_id,
                    "error": "missing status",
                }));
                continue;
            }
        };

        let justification = obj.get("justification").and_then(|v| v.as_str());

        match user_exists(&tx, &student_id) {
            Ok(true) => {}
            Ok(false) => {
                errors.push(json!({
                    "studentId": student_id,
                    "error": "student not found",
                }));
                continue;
            }
            Err(e) => {
                errors.push(json!({
                    "studentId": student_id,
                    "error": e.message,
                }));
                continue;
            }
        }

        match upsert_attendance(
            &tx,
            &student_id,
            &course,
            &day,
            status,
            justification,
            &recorded_by,
        ) {
            Ok(attendance_id) => records.push(json!({
                "attendanceId": attendance_id,
                "studentId": student_id,
                "day": day,
                "status": status.as_str(),
                "justification": justification,
            })),
            Err(e) => errors.push(json!({
                "studentId": student_id,
                "error": e.message,
            })),
        }
    }

    if records.is_empty() {
        let _ = tx.rollback();
        return Err(HandlerErr {
            code: "batch_empty",
            message: "no attendance items could be recorded".to_string(),
            details: Some(json!({ "errors": errors })),
        });
    }

    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    Ok(json!({
        "count": records.len(),
        "records": records,
        "errors": errors,
    }))
}

fn create_attendance(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !user_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let course_id = get_opt_str(params, "courseId");
    let course_name = get_opt_str(params, "courseName");
    let course = CourseRef::resolve(conn, course_id.as_deref(), course_name.as_deref())?;

    let day = match get_opt_str(params, "day") {
        Some(raw) => parse_day(&raw)?,
        None => today(),
    };
    let status_raw = get_required_str(params, "status")?;
    let Some(status) = AttendanceStatus::parse(&status_raw) else {
        return Err(HandlerErr::bad_params(format!("invalid status: {}", status_raw)));
    };
    let justification = get_opt_str(params, "justification");
    let recorded_by = get_opt_str(params, "recordedBy").unwrap_or_default();

    let attendance_id = upsert_attendance(
        conn,
        &student_id,
        &course,
        &day,
        status,
        justification.as_deref(),
        &recorded_by,
    )?;

    fetch_record(conn, &attendance_id)
}

fn fetch_record(conn: &Connection, attendance_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, student_id, course_id, course_name, day, status,
                    justification, recorded_by, created_at, updated_at
             FROM attendance WHERE id = ?",
            [attendance_id],
            |r| {
                Ok(json!({
                    "attendanceId": r.get::<_, String>(0)?,
                    "studentId": r.get::<_, String>(1)?,
                    "courseId": r.get::<_, Option<String>>(2)?,
                    "courseName": r.get::<_, String>(3)?,
                    "day": r.get::<_, String>(4)?,
                    "status": r.get::<_, String>(5)?,
                    "justification": r.get::<_, Option<String>>(6)?,
                    "recordedBy": r.get::<_, Option<String>>(7)?,
                    "createdAt": r.get::<_, Option<String>>(8)?,
                    "updatedAt": r.get::<_, Option<String>>(9)?,
                }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    row.ok_or_else(|| HandlerErr::not_found("attendance record not found"))
}

fn list_by_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !user_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    let course_filter = get_opt_str(params, "courseId");

    let sql = match course_filter {
        Some(_) => {
            "SELECT id, student_id, course_id, course_name, day, status,
                    justification, recorded_by
             FROM attendance
             WHERE student_id = ? AND course_key = ?
             ORDER BY day DESC"
        }
        None => {
            "SELECT id, student_id, course_id, course_name, day, status,
                    justification, recorded_by
             FROM attendance
             WHERE student_id = ?
             ORDER BY day DESC"
        }
    };

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<(serde_json::Value, String)> {
        let status: String = r.get(5)?;
        let record = json!({
            "attendanceId": r.get::<_, String>(0)?,
            "studentId": r.get::<_, String>(1)?,
            "courseId": r.get::<_, Option<String>>(2)?,
            "courseName": r.get::<_, String>(3)?,
            "day": r.get::<_, String>(4)?,
            "status": status,
            "justification": r.get::<_, Option<String>>(6)?,
            "recordedBy": r.get::<_, Option<String>>(7)?,
        });
        Ok((record, status))
    };

    let rows = match &course_filter {
        Some(course_key) => stmt
            .query_map((&student_id, course_key), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([&student_id], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let stats = stats::attendance_stats(
        rows.iter()
            .filter_map(|(_, status)| AttendanceStatus::parse(status)),
    );
    let records: Vec<serde_json::Value> = rows.into_iter().map(|(record, _)| record).collect();

    Ok(json!({
        "count": records.len(),
        "records": records,
        "stats": stats,
    }))
}

fn attendance_stats_for(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let course_filter = get_opt_str(params, "courseId");
    let stats = compute_stats(conn, &student_id, course_filter.as_deref())?;
    Ok(serde_json::to_value(stats).unwrap_or_else(|_| json!({})))
}

pub fn compute_stats(
    conn: &Connection,
    student_id: &str,
    course_key: Option<&str>,
) -> Result<stats::AttendanceStats, HandlerErr> {
    let sql = match course_key {
        Some(_) => "SELECT status FROM attendance WHERE student_id = ? AND course_key = ?",
        None => "SELECT status FROM attendance WHERE student_id = ?",
    };
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let statuses = match course_key {
        Some(key) => stmt
            .query_map((student_id, key), |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([student_id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(stats::attendance_stats(
        statuses.iter().filter_map(|s| AttendanceStatus::parse(s)),
    ))
}

fn update_attendance(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let attendance_id = get_required_str(params, "attendanceId")?;
    // Only status and justification are correctable after the fact.
    let status = match params.get("status").and_then(|v| v.as_str()) {
        Some(raw) => match AttendanceStatus::parse(raw) {
            Some(s) => Some(s),
            None => return Err(HandlerErr::bad_params(format!("invalid status: {}", raw))),
        },
        None => None,
    };
    let justification_present = params.get("justification").is_some();
    let justification = params.get("justification").and_then(|v| v.as_str());

    let exists: Option<String> = conn
        .query_row(
            "SELECT id FROM attendance WHERE id = ?",
            [&attendance_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("attendance record not found"));
    }

    let now = now_rfc3339();
    if let Some(status) = status {
        conn.execute(
            "UPDATE attendance SET status = ?, updated_at = ? WHERE id = ?",
            (status.as_str(), &now, &attendance_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if justification_present {
        conn.execute(
            "UPDATE attendance SET justification = ?, updated_at = ? WHERE id = ?",
            (justification, &now, &attendance_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    fetch_record(conn, &attendance_id)
}

fn delete_attendance(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let attendance_id = get_required_str(params, "attendanceId")?;
    let deleted = conn
        .execute("DELETE FROM attendance WHERE id = ?", [&attendance_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("attendance record not found"));
    }
    Ok(json!({ "ok": true }))
}

fn dispatch(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.recordBatch" => Some(dispatch(state, req, record_batch)),
        "attendance.create" => Some(dispatch(state, req, create_attendance)),
        "attendance.listByStudent" => Some(dispatch(state, req, list_by_student)),
        "attendance.stats" => Some(dispatch(state, req, attendance_stats_for)),
        "attendance.update" => Some(dispatch(state, req, update_attendance)),
        "attendance.delete" => Some(dispatch(state, req, delete_attendance)),
        _ => None,
    }
}
