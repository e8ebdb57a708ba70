use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_opt_str, get_required_str, now_rfc3339, parse_day, today, user_exists, CourseRef,
    HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use crate::stats::{self, GradeCategory, GradeRow};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const DEFAULT_MAX_SCORE: f64 = 100.0;
const DEFAULT_WEIGHT: f64 = 0.3;

fn fetch_grade(conn: &Connection, grade_id: &str) -> Result<serde_json::Value, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, student_id, course_id, course_name, score, max_score,
                    weight, category, occurred_on, description
             FROM grades WHERE id = ?",
            [grade_id],
            |r| {
                Ok(json!({
                    "gradeId": r.get::<_, String>(0)?,
                    "studentId": r.get::<_, String>(1)?,
                    "courseId": r.get::<_, Option<String>>(2)?,
                    "courseName": r.get::<_, String>(3)?,
                    "score": r.get::<_, f64>(4)?,
                    "maxScore": r.get::<_, f64>(5)?,
                    "weight": r.get::<_, f64>(6)?,
                    "category": r.get::<_, String>(7)?,
                    "occurredOn": r.get::<_, String>(8)?,
                    "description": r.get::<_, Option<String>>(9)?,
                }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    row.ok_or_else(|| HandlerErr::not_found("grade not found"))
}

fn create_grade(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !user_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }

    let course_id = get_opt_str(params, "courseId");
    let course_name = get_opt_str(params, "courseName");
    let course = CourseRef::resolve(conn, course_id.as_deref(), course_name.as_deref())?;

    let Some(score) = params.get("score").and_then(|v| v.as_f64()) else {
        return Err(HandlerErr::bad_params("missing score"));
    };
    if !(0.0..=100.0).contains(&score) {
        return Err(HandlerErr::bad_params("score must be between 0 and 100")
            .with_details(json!({ "score": score })));
    }

    let max_score = params
        .get("maxScore")
        .and_then(|v| v.as_f64())
        .unwrap_or(DEFAULT_MAX_SCORE);
    if max_score <= 0.0 {
        return Err(HandlerErr::bad_params("maxScore must be positive")
            .with_details(json!({ "maxScore": max_score })));
    }

    let weight = params
        .get("weight")
        .and_then(|v| v.as_f64())
        .unwrap_or(DEFAULT_WEIGHT);
    if !(0.0..=1.0).contains(&weight) {
        return Err(HandlerErr::bad_params("weight must be between 0 and 1")
            .with_details(json!({ "weight": weight })));
    }

    let category = get_required_str(params, "category")?;
    if GradeCategory::parse(&category).is_none() {
        return Err(HandlerErr::bad_params(
            "category must be one of: exam, assignment, project, final",
        )
        .with_details(json!({ "category": category })));
    }

    let occurred_on = match get_opt_str(params, "occurredOn") {
        Some(raw) => parse_day(&raw)?,
        None => today(),
    };
    let description = get_opt_str(params, "description");

    let grade_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    conn.execute(
        "INSERT INTO grades(id, student_id, course_id, course_name, score, max_score,
                            weight, category, occurred_on, description, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &grade_id,
            &student_id,
            course.id(),
            course.name(),
            score,
            max_score,
            weight,
            &category,
            &occurred_on,
            description.as_deref(),
            &now,
            &now,
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "grades" })))?;

    fetch_grade(conn, &grade_id)
}

/// Grades are immutable once filed except for staff score/weight correction.
fn update_grade(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;

    let exists: Option<String> = conn
        .query_row("SELECT id FROM grades WHERE id = ?", [&grade_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    if exists.is_none() {
        return Err(HandlerErr::not_found("grade not found"));
    }

    let score = params.get("score").and_then(|v| v.as_f64());
    let weight = params.get("weight").and_then(|v| v.as_f64());
    if score.is_none() && weight.is_none() {
        return Err(HandlerErr::bad_params("nothing to update: provide score and/or weight"));
    }
    if let Some(score) = score {
        if !(0.0..=100.0).contains(&score) {
            return Err(HandlerErr::bad_params("score must be between 0 and 100")
                .with_details(json!({ "score": score })));
        }
    }
    if let Some(weight) = weight {
        if !(0.0..=1.0).contains(&weight) {
            return Err(HandlerErr::bad_params("weight must be between 0 and 1")
                .with_details(json!({ "weight": weight })));
        }
    }

    let now = now_rfc3339();
    if let Some(score) = score {
        conn.execute(
            "UPDATE grades SET score = ?, updated_at = ? WHERE id = ?",
            (score, &now, &grade_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }
    if let Some(weight) = weight {
        conn.execute(
            "UPDATE grades SET weight = ?, updated_at = ? WHERE id = ?",
            (weight, &now, &grade_id),
        )
        .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    }

    fetch_grade(conn, &grade_id)
}

fn delete_grade(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let grade_id = get_required_str(params, "gradeId")?;
    let deleted = conn
        .execute("DELETE FROM grades WHERE id = ?", [&grade_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("grade not found"));
    }
    Ok(json!({ "ok": true }))
}

fn list_by_student(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    if !user_exists(conn, &student_id)? {
        return Err(HandlerErr::not_found("student not found"));
    }
    let course_filter = get_opt_str(params, "courseId");

    let sql = match course_filter {
        Some(_) => {
            "SELECT id, student_id, course_id, course_name, score, max_score,
                    weight, category, occurred_on, description
             FROM grades
             WHERE student_id = ? AND course_id = ?
             ORDER BY occurred_on DESC"
        }
        None => {
            "SELECT id, student_id, course_id, course_name, score, max_score,
                    weight, category, occurred_on, description
             FROM grades
             WHERE student_id = ?
             ORDER BY occurred_on DESC"
        }
    };

    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<serde_json::Value> {
        Ok(json!({
            "gradeId": r.get::<_, String>(0)?,
            "studentId": r.get::<_, String>(1)?,
            "courseId": r.get::<_, Option<String>>(2)?,
            "courseName": r.get::<_, String>(3)?,
            "score": r.get::<_, f64>(4)?,
            "maxScore": r.get::<_, f64>(5)?,
            "weight": r.get::<_, f64>(6)?,
            "category": r.get::<_, String>(7)?,
            "occurredOn": r.get::<_, String>(8)?,
            "description": r.get::<_, Option<String>>(9)?,
        }))
    };

    let grades = match &course_filter {
        Some(course_id) => stmt
            .query_map((&student_id, course_id), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([&student_id], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({
        "count": grades.len(),
        "grades": grades,
    }))
}

fn summary(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let course_filter = get_opt_str(params, "courseId");
    let summary = compute_summary(conn, &student_id, course_filter.as_deref())?;
    Ok(serde_json::to_value(summary).unwrap_or_else(|_| json!({})))
}

pub fn compute_summary(
    conn: &Connection,
    student_id: &str,
    course_id: Option<&str>,
) -> Result<stats::GradeSummary, HandlerErr> {
    let sql = match course_id {
        Some(_) => "SELECT score, max_score, weight FROM grades WHERE student_id = ? AND course_id = ?",
        None => "SELECT score, max_score, weight FROM grades WHERE student_id = ?",
    };
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<GradeRow> {
        Ok(GradeRow {
            score: r.get(0)?,
            max_score: r.get(1)?,
            weight: r.get(2)?,
        })
    };

    let rows = match course_id {
        Some(cid) => stmt
            .query_map((student_id, cid), map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([student_id], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    }
    .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(stats::grade_summary(rows))
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
        "grades.create" => Some(dispatch(state, req, create_grade)),
        "grades.update" => Some(dispatch(state, req, update_grade)),
        "grades.delete" => Some(dispatch(state, req, delete_grade)),
        "grades.listByStudent" => Some(dispatch(state, req, list_by_student)),
        "grades.summary" => Some(dispatch(state, req, summary)),
        _ => None,
    }
}
