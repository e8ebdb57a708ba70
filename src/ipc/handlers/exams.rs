use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    course_exists, get_opt_str, get_required_str, now_rfc3339, parse_day, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn exam_json(r: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "examId": r.get::<_, String>(0)?,
        "courseId": r.get::<_, String>(1)?,
        "title": r.get::<_, String>(2)?,
        "description": r.get::<_, Option<String>>(3)?,
        "date": r.get::<_, String>(4)?,
        "maxGrade": r.get::<_, f64>(5)?,
        "weight": r.get::<_, f64>(6)?,
    }))
}

const EXAM_COLS: &str = "id, course_id, title, description, date, max_grade, weight";

fn list_by_course(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let course_id = get_required_str(params, "courseId")?;
    if !course_exists(conn, &course_id)? {
        return Err(HandlerErr::not_found("course not found"));
    }
    let from = match get_opt_str(params, "from") {
        Some(raw) => Some(parse_day(&raw)?),
        None => None,
    };

    let sql = match from {
        Some(_) => format!(
            "SELECT {} FROM exams WHERE course_id = ? AND date >= ? ORDER BY date",
            EXAM_COLS
        ),
        None => format!(
            "SELECT {} FROM exams WHERE course_id = ? ORDER BY date",
            EXAM_COLS
        ),
    };
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let exams = match &from {
        Some(from) => stmt
            .query_map((&course_id, from), exam_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([&course_id], exam_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({ "count": exams.len(), "exams": exams }))
}

fn create_exam(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
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

    let max_grade = params
        .get("maxGrade")
        .and_then(|v| v.as_f64())
        .unwrap_or(100.0);
    if max_grade < 1.0 {
        return Err(HandlerErr::bad_params("maxGrade must be at least 1")
            .with_details(json!({ "maxGrade": max_grade })));
    }
    let weight = params.get("weight").and_then(|v| v.as_f64()).unwrap_or(0.3);
    if !(0.0..=1.0).contains(&weight) {
        return Err(HandlerErr::bad_params("weight must be between 0 and 1")
            .with_details(json!({ "weight": weight })));
    }

    let exam_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO exams(id, course_id, title, description, date, max_grade,
                           weight, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &exam_id,
            &course_id,
            &title,
            description.as_deref(),
            &date,
            max_grade,
            weight,
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "exams" })))?;

    fetch_exam(conn, &exam_id)
}

fn fetch_exam(conn: &Connection, exam_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!("SELECT {} FROM exams WHERE id = ?", EXAM_COLS);
    let exam = conn
        .query_row(&sql, [exam_id], exam_json)
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    exam.ok_or_else(|| HandlerErr::not_found("exam not found"))
}

fn update_exam(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM exams WHERE id = ?", [&exam_id], |r| r.get(0))
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("exam not found"));
    }

    let now = now_rfc3339();
    if let Some(title) = get_opt_str(params, "title") {
        let title = title.trim().to_string();
        if title.is_empty() {
            return Err(HandlerErr::bad_params("title must not be empty"));
        }
        conn.execute(
            "UPDATE exams SET title = ?, updated_at = ? WHERE id = ?",
            (&title, &now, &exam_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(description) = get_opt_str(params, "description") {
        conn.execute(
            "UPDATE exams SET description = ?, updated_at = ? WHERE id = ?",
            (&description, &now, &exam_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(date) = get_opt_str(params, "date") {
        let date = parse_day(&date)?;
        conn.execute(
            "UPDATE exams SET date = ?, updated_at = ? WHERE id = ?",
            (&date, &now, &exam_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(max_grade) = params.get("maxGrade").and_then(|v| v.as_f64()) {
        if max_grade < 1.0 {
            return Err(HandlerErr::bad_params("maxGrade must be at least 1")
                .with_details(json!({ "maxGrade": max_grade })));
        }
        conn.execute(
            "UPDATE exams SET max_grade = ?, updated_at = ? WHERE id = ?",
            (max_grade, &now, &exam_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(weight) = params.get("weight").and_then(|v| v.as_f64()) {
        if !(0.0..=1.0).contains(&weight) {
            return Err(HandlerErr::bad_params("weight must be between 0 and 1")
                .with_details(json!({ "weight": weight })));
        }
        conn.execute(
            "UPDATE exams SET weight = ?, updated_at = ? WHERE id = ?",
            (weight, &now, &exam_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    fetch_exam(conn, &exam_id)
}

fn delete_exam(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let exam_id = get_required_str(params, "examId")?;
    let deleted = conn
        .execute("DELETE FROM exams WHERE id = ?", [&exam_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("exam not found"));
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
        "exams.listByCourse" => Some(dispatch(state, req, list_by_course)),
        "exams.create" => Some(dispatch(state, req, create_exam)),
        "exams.update" => Some(dispatch(state, req, update_exam)),
        "exams.delete" => Some(dispatch(state, req, delete_exam)),
        _ => None,
    }
}
