use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_opt_str, get_required_str, now_rfc3339, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const ROLES: [&str; 3] = ["student", "teacher", "admin"];

fn user_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "userId": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "email": r.get::<_, String>(2)?,
        "registration": r.get::<_, String>(3)?,
        "role": r.get::<_, String>(4)?,
        "courseName": r.get::<_, String>(5)?,
        "semester": r.get::<_, i64>(6)?,
        "active": r.get::<_, i64>(7)? != 0,
    }))
}

const USER_COLS: &str = "id, name, email, registration, role, course_name, semester, active";

fn list_users(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role = get_opt_str(params, "role");
    if let Some(role) = &role {
        if !ROLES.contains(&role.as_str()) {
            return Err(HandlerErr::bad_params(format!("unknown role: {}", role)));
        }
    }

    let sql = match role {
        Some(_) => format!("SELECT {} FROM users WHERE role = ? ORDER BY name", USER_COLS),
        None => format!("SELECT {} FROM users ORDER BY name", USER_COLS),
    };
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let users = match &role {
        Some(role) => stmt
            .query_map([role], user_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([], user_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "count": users.len(), "users": users }))
}

fn get_user(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let sql = format!("SELECT {} FROM users WHERE id = ?", USER_COLS);
    let user = conn
        .query_row(&sql, [&user_id], user_json)
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    user.ok_or_else(|| HandlerErr::not_found("user not found"))
}

/// Registration numbers are two-digit year + five-digit sequence, continuing
/// from the highest already issued for the current year.
fn next_registration(conn: &Connection) -> Result<String, HandlerErr> {
    let year = chrono::Local::now().year() % 100;
    let prefix = format!("{:02}", year);
    let last: Option<String> = conn
        .query_row(
            "SELECT registration FROM users WHERE registration LIKE ? || '%'
             ORDER BY registration DESC LIMIT 1",
            [&prefix],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let sequence = last
        .as_deref()
        .and_then(|reg| reg.get(2..))
        .and_then(|tail| tail.parse::<u32>().ok())
        .unwrap_or(0)
        + 1;
    Ok(format!("{}{:05}", prefix, sequence))
}

fn create_user(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?.trim().to_string();
    if name.is_empty() {
        return Err(HandlerErr::bad_params("name must not be empty"));
    }
    let email = get_required_str(params, "email")?
        .trim()
        .to_ascii_lowercase();
    if email.is_empty() {
        return Err(HandlerErr::bad_params("email must not be empty"));
    }

    let role = get_opt_str(params, "role").unwrap_or_else(|| "student".to_string());
    if !ROLES.contains(&role.as_str()) {
        return Err(HandlerErr::bad_params(format!("unknown role: {}", role)));
    }

    let registration = match get_opt_str(params, "registration").map(|r| r.trim().to_string()) {
        Some(r) if !r.is_empty() => r,
        _ => next_registration(conn)?,
    };

    let duplicate: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM users WHERE email = ? OR registration = ?",
            (&email, &registration),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if duplicate.is_some() {
        return Err(HandlerErr::bad_params("email or registration already in use"));
    }

    let course_name = get_opt_str(params, "courseName")
        .map(|c| c.trim().to_string())
        .unwrap_or_default();
    let semester = params.get("semester").and_then(|v| v.as_i64()).unwrap_or(1);

    let user_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO users(id, name, email, registration, role, course_name,
                           semester, active, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        (
            &user_id,
            &name,
            &email,
            &registration,
            &role,
            &course_name,
            semester,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "users" })))?;

    Ok(json!({
        "userId": user_id,
        "name": name,
        "email": email,
        "registration": registration,
        "role": role,
        "courseName": course_name,
        "semester": semester,
        "active": true,
    }))
}

fn update_user(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("user not found"));
    }

    let now = now_rfc3339();

    if let Some(name) = get_opt_str(params, "name") {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        conn.execute(
            "UPDATE users SET name = ?, updated_at = ? WHERE id = ?",
            (&name, &now, &user_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(email) = get_opt_str(params, "email") {
        let email = email.trim().to_ascii_lowercase();
        let duplicate: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM users WHERE email = ? AND id != ?",
                (&email, &user_id),
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        if duplicate.is_some() {
            return Err(HandlerErr::bad_params("email already in use"));
        }
        conn.execute(
            "UPDATE users SET email = ?, updated_at = ? WHERE id = ?",
            (&email, &now, &user_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(role) = get_opt_str(params, "role") {
        if !ROLES.contains(&role.as_str()) {
            return Err(HandlerErr::bad_params(format!("unknown role: {}", role)));
        }
        conn.execute(
            "UPDATE users SET role = ?, updated_at = ? WHERE id = ?",
            (&role, &now, &user_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(course_name) = get_opt_str(params, "courseName") {
        conn.execute(
            "UPDATE users SET course_name = ?, updated_at = ? WHERE id = ?",
            (course_name.trim(), &now, &user_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(semester) = params.get("semester").and_then(|v| v.as_i64()) {
        conn.execute(
            "UPDATE users SET semester = ?, updated_at = ? WHERE id = ?",
            (semester, &now, &user_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(active) = params.get("active").and_then(|v| v.as_bool()) {
        conn.execute(
            "UPDATE users SET active = ?, updated_at = ? WHERE id = ?",
            (active as i64, &now, &user_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    get_user(conn, &json!({ "userId": user_id }))
}

fn delete_user(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM users WHERE id = ?", [&user_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("user not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;

    // Delete dependents in order; the store has no ON DELETE CASCADE.
    for (table, sql) in [
        ("course_students", "DELETE FROM course_students WHERE student_id = ?"),
        ("grades", "DELETE FROM grades WHERE student_id = ?"),
        ("attendance", "DELETE FROM attendance WHERE student_id = ?"),
        ("users", "DELETE FROM users WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&user_id]) {
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
        "users.list" => Some(dispatch(state, req, list_users)),
        "users.get" => Some(dispatch(state, req, get_user)),
        "users.create" => Some(dispatch(state, req, create_user)),
        "users.update" => Some(dispatch(state, req, update_user)),
        "users.delete" => Some(dispatch(state, req, delete_user)),
        _ => None,
    }
}
