use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_str, get_required_str, now_rfc3339, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const COURSE_STATUSES: [&str; 3] = ["enrolled", "completed", "dropped"];

fn course_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "courseId": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "code": r.get::<_, String>(2)?,
        "credits": r.get::<_, i64>(3)?,
        "professorName": r.get::<_, String>(4)?,
        "schedule": r.get::<_, String>(5)?,
        "room": r.get::<_, String>(6)?,
        "status": r.get::<_, String>(7)?,
        "description": r.get::<_, Option<String>>(8)?,
        "semester": r.get::<_, i64>(9)?,
    }))
}

const COURSE_COLS: &str =
    "id, name, code, credits, professor_name, schedule, room, status, description, semester";

fn enrolled_students(conn: &Connection, course_id: &str) -> Result<Vec<serde_json::Value>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT u.id, u.name, u.email, u.registration
             FROM course_students cs
             JOIN users u ON u.id = cs.student_id
             WHERE cs.course_id = ?
             ORDER BY u.name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map([course_id], |r| {
        Ok(json!({
            "userId": r.get::<_, String>(0)?,
            "name": r.get::<_, String>(1)?,
            "email": r.get::<_, String>(2)?,
            "registration": r.get::<_, String>(3)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn list_courses(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    // Include an enrollment count so list consumers can skip the per-course get.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id, c.name, c.code, c.credits, c.professor_name, c.schedule,
               c.room, c.status, c.description, c.semester,
               (SELECT COUNT(*) FROM course_students cs WHERE cs.course_id = c.id) AS student_count
             FROM courses c
             ORDER BY c.name",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let courses = stmt
        .query_map([], |r| {
            let mut course = course_json(r)?;
            course["studentCount"] = json!(r.get::<_, i64>(10)?);
            Ok(course)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "count": courses.len(), "courses": courses }))
}

fn get_course(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let sql = format!("SELECT {} FROM courses WHERE id = ?", COURSE_COLS);
    let course = conn
        .query_row(&sql, [&course_id], course_json)
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(mut course) = course else {
        return Err(HandlerErr::not_found("course not found"));
    };
    course["students"] = json!(enrolled_students(conn, &course_id)?);
    Ok(course)
}

fn create_course(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let code = get_required_str(params, "code")?.trim().to_string();
    if code.is_empty() {
        return Err(HandlerErr::bad_params("code must not be empty"));
    }
    let Some(credits) = params.get("credits").and_then(|v| v.as_i64()) else {
        return Err(HandlerErr::bad_params("missing credits"));
    };
    if credits < 1 {
        return Err(HandlerErr::bad_params("credits must be at least 1"));
    }
    let professor_name = get_required_str(params, "professorName")?.trim().to_string();
    let schedule = get_required_str(params, "schedule")?;
    let room = get_required_str(params, "room")?;
    let Some(semester) = params.get("semester").and_then(|v| v.as_i64()) else {
        return Err(HandlerErr::bad_params("missing semester"));
    };
    let status = get_opt_str(params, "status").unwrap_or_else(|| "enrolled".to_string());
    if !COURSE_STATUSES.contains(&status.as_str()) {
        return Err(HandlerErr::bad_params(format!("unknown status: {}", status)));
    }
    let description = get_opt_str(params, "description");

    let duplicate: Option<i64> = conn
        .query_row("SELECT 1 FROM courses WHERE code = ?", [&code], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if duplicate.is_some() {
        return Err(HandlerErr::bad_params("course code already exists")
            .with_details(json!({ "code": code })));
    }

    let course_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO courses(id, name, code, credits, professor_name, schedule,
                             room, status, description, semester, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &course_id,
            &name,
            &code,
            credits,
            &professor_name,
            &schedule,
            &room,
            &status,
            description.as_deref(),
            semester,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "courses" })))?;

    get_course(conn, &json!({ "courseId": course_id }))
}

fn update_course(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("course not found"));
    }

    let now = now_rfc3339();

    if let Some(code) = get_opt_str(params, "code") {
        let code = code.trim().to_string();
        let duplicate: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM courses WHERE code = ? AND id != ?",
                (&code, &course_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        if duplicate.is_some() {
            return Err(HandlerErr::bad_params("course code already exists")
                .with_details(json!({ "code": code })));
        }
        conn.execute(
            "UPDATE courses SET code = ?, updated_at = ? WHERE id = ?",
            (&code, &now, &course_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(status) = get_opt_str(params, "status") {
        if !COURSE_STATUSES.contains(&status.as_str()) {
            return Err(HandlerErr::bad_params(format!("unknown status: {}", status)));
        }
        conn.execute(
            "UPDATE courses SET status = ?, updated_at = ? WHERE id = ?",
            (&status, &now, &course_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    for (key, column) in [
        ("name", "name"),
        ("professorName", "professor_name"),
        ("schedule", "schedule"),
        ("room", "room"),
        ("description", "description"),
    ] {
        if let Some(value) = get_opt_str(params, key) {
            let sql = format!("UPDATE courses SET {} = ?, updated_at = ? WHERE id = ?", column);
            conn.execute(&sql, (&value, &now, &course_id))
                .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        }
    }
    for (key, column) in [("credits", "credits"), ("semester", "semester")] {
        if let Some(value) = params.get(key).and_then(|v| v.as_i64()) {
            if key == "credits" && value < 1 {
                return Err(HandlerErr::bad_params("credits must be at least 1"));
            }
            let sql = format!("UPDATE courses SET {} = ?, updated_at = ? WHERE id = ?", column);
            conn.execute(&sql, (value, &now, &course_id))
                .map_err(|e| HandlerErr::db("db_update_failed", e))?;
        }
    }

    get_course(conn, &json!({ "courseId": course_id }))
}

fn delete_course(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("course not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    // Delete dependents in order. Grade and attendance history keeps its
    // denormalized course_name and is intentionally left in place.
    for (table, sql) in [
        ("lessons", "DELETE FROM lessons WHERE course_id = ?"),
        ("exams", "DELETE FROM exams WHERE course_id = ?"),
        ("course_students", "DELETE FROM course_students WHERE course_id = ?"),
        ("courses", "DELETE FROM courses WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&course_id]) {
            let _ = tx.rollback();
            return Err(
                HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": table }))
            );
        }
    }

    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn add_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let student_id = get_required_str(params, "studentId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("course not found"));
    }

    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [&student_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if role.as_deref() != Some("student") {
        return Err(HandlerErr::not_found("student not found"));
    }

    let enrolled: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM course_students WHERE course_id = ? AND student_id = ?",
            (&course_id, &student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if enrolled.is_some() {
        return Err(HandlerErr::bad_params("student already enrolled"));
    }

    conn.execute(
        "INSERT INTO course_students(course_id, student_id) VALUES(?, ?)",
        (&course_id, &student_id),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "course_students" }))
    })?;

    let students = enrolled_students(conn, &course_id)?;
    Ok(json!({ "courseId": course_id, "students": students }))
}

fn remove_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    let student_id = get_required_str(params, "studentId")?;

    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("course not found"));
    }

    // Removal is idempotent: removing an unenrolled student is a no-op.
    conn.execute(
        "DELETE FROM course_students WHERE course_id = ? AND student_id = ?",
        (&course_id, &student_id),
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", e))?;

    let students = enrolled_students(conn, &course_id)?;
    Ok(json!({ "courseId": course_id, "students": students }))
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
        "courses.list" => Some(dispatch(state, req, list_courses)),
        "courses.get" => Some(dispatch(state, req, get_course)),
        "courses.create" => Some(dispatch(state, req, create_course)),
        "courses.update" => Some(dispatch(state, req, update_course)),
        "courses.delete" => Some(dispatch(state, req, delete_course)),
        "courses.addStudent" => Some(dispatch(state, req, add_student)),
        "courses.removeStudent" => Some(dispatch(state, req, remove_student)),
        _ => None,
    }
}
