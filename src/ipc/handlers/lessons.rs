use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    course_exists, get_opt_str, get_required_str, now_rfc3339, parse_day, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn lesson_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    let resources_raw: String = r.get(4)?;
    let resources: serde_json::Value =
        serde_json::from_str(&resources_raw).unwrap_or_else(|_| json!([]));
    Ok(json!({
        "lessonId": r.get::<_, String>(0)?,
        "courseId": r.get::<_, String>(1)?,
        "title": r.get::<_, String>(2)?,
        "description": r.get::<_, Option<String>>(3)?,
        "resources": resources,
        "date": r.get::<_, String>(5)?,
    }))
}

const LESSON_COLS: &str = "id, course_id, title, description, resources, date";

fn parse_resources(params: &serde_json::Value) -> Result<String, HandlerErr> {
    let Some(raw) = params.get("resources") else {
        return Ok("[]".to_string());
    };
    let Some(arr) = raw.as_array() else {
        return Err(HandlerErr::bad_params("resources must be an array of strings"));
    };
    if !arr.iter().all(|v| v.is_string()) {
        return Err(HandlerErr::bad_params("resources must be an array of strings"));
    }
    serde_json::to_string(arr).map_err(|e| HandlerErr::bad_params(e.to_string()))
}

fn list_by_course(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr::not_found("course not found"));
    }
    // Optional lower bound so callers can ask for upcoming lessons only.
    let from = match get_opt_str(params, "from") {
        Some(raw) => Some(parse_day(&raw)?),
        None => None,
    };

    let sql = match from {
        Some(_) => format!(
            "SELECT {} FROM lessons WHERE course_id = ? AND date >= ? ORDER BY date",
            LESSON_COLS
        ),
        None => format!(
            "SELECT {} FROM lessons WHERE course_id = ? ORDER BY date",
            LESSON_COLS
        ),
    };
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let lessons = match &from {
        Some(from) => stmt
            .query_map((&course_id, from), lesson_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([&course_id], lesson_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "count": lessons.len(), "lessons": lessons }))
}

fn create_lesson(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr::not_found("course not found"));
    }
    let title = get_required_str(params, "title")?.trim().to_string();
    if title.is_empty() {
        return Err(HandlerErr::bad_params("title must not be empty"));
    }
    let date = parse_day(&get_required_str(params, "date")?)?;
    let description = get_opt_str(params, "description");
    let resources = parse_resources(params)?;

    let lesson_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO lessons(id, course_id, title, description, date, resources,
                             created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &lesson_id,
            &course_id,
            &title,
            description.as_deref(),
            &date,
            &resources,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "lessons" })))?;

    fetch_lesson(conn, &lesson_id)
}

fn fetch_lesson(conn: &Connection, lesson_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("SELECT {} FROM lessons WHERE id = ?", LESSON_COLS);
    let lesson = conn
        .query_row(&sql, [lesson_id], lesson_json)
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    lesson.ok_or_else(|| HandlerErr::not_found("lesson not found"))
}

fn update_lesson(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let lesson_id = get_required_str(params, "lessonId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM lessons WHERE id = ?", [&lesson_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("lesson not found"));
    }

    let now = now_rfc3339();
    if let Some(title) = get_opt_str(params, "title") {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(HandlerErr::bad_params("title must not be empty"));
        }
        conn.execute(
            "UPDATE lessons SET title = ?, updated_at = ? WHERE id = ?",
            (&title, &now, &lesson_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(description) = get_opt_str(params, "description") {
        conn.execute(
            "UPDATE lessons SET description = ?, updated_at = ? WHERE id = ?",
            (&description, &now, &lesson_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(date) = get_opt_str(params, "date") {
        let date = parse_day(&date)?;
        conn.execute(
            "UPDATE lessons SET date = ?, updated_at = ? WHERE id = ?",
            (&date, &now, &lesson_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if params.get("resources").is_some() {
        let resources = parse_resources(params)?;
        conn.execute(
            "UPDATE lessons SET resources = ?, updated_at = ? WHERE id = ?",
            (&resources, &now, &lesson_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    fetch_lesson(conn, &lesson_id)
}

fn delete_lesson(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let lesson_id = get_required_str(params, "lessonId")?;
    let deleted = conn
        .execute("DELETE FROM lessons WHERE id = ?", [&lesson_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("lesson not found"));
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
        "lessons.listByCourse" => Some(dispatch(state, req, list_by_course)),
        "lessons.create" => Some(dispatch(state, req, create_lesson)),
        "lessons.update" => Some(dispatch(state, req, update_lesson)),
        "lessons.delete" => Some(dispatch(state, req, delete_lesson)),
        _ => None,
    }
}
