use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{attendance, grades};
use crate::ipc::helpers::{get_opt_str, get_required_str, parse_day, today, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::stats::{self, GradeRow};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;

const UPCOMING_LIMIT: i64 = 5;
const RECENT_GRADES_LIMIT: i64 = 5;
const POPULAR_COURSES_LIMIT: usize = 5;

fn reference_day(params: &serde_json::Value) -> Result<String, HandlerErr> {
    match get_opt_str(params, "today") {
        Some(raw) => parse_day(&raw),
        None => Ok(today()),
    }
}

fn course_grade_summary(conn: &Connection, course_id: &str) -> Result<stats::GradeSummary, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT score, max_score, weight FROM grades WHERE course_id = ?")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([course_id], |r| {
            Ok(GradeRow {
                score: r.get(0)?,
                max_score: r.get(1)?,
                weight: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(stats::grade_summary(rows))
}

/// Head-count by the course name students carry on their profile, which is
/// what the legacy reports keyed on (not the enrollment rows).
fn declared_student_count(conn: &Connection, course_name: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        "SELECT COUNT(*) FROM users WHERE course_name = ? AND role = 'student'",
        [course_name],
        |r| r.get(0),
    )
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn upcoming_lessons(
    conn: &Connection,
    course_ids: &[String],
    from_day: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    if course_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = std::iter::repeat_n("?", course_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT id, course_id, title, date FROM lessons
         WHERE course_id IN ({}) AND date >= ?
         ORDER BY date LIMIT ?",
        placeholders
    );
    let mut bind: Vec<Value> = course_ids.iter().map(|id| Value::Text(id.clone())).collect();
    bind.push(Value::Text(from_day.to_string()));
    bind.push(Value::Integer(UPCOMING_LIMIT));

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map(params_from_iter(bind), |r| {
        Ok(json!({
            "lessonId": r.get::<_, String>(0)?,
            "courseId": r.get::<_, String>(1)?,
            "title": r.get::<_, String>(2)?,
            "date": r.get::<_, String>(3)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn upcoming_exams(
    conn: &Connection,
    course_ids: &[String],
    from_day: &str,
) -> Result<Vec<serde_json::Value>, HandlerErr> {
    if course_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = std::iter::repeat_n("?", course_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT id, course_id, title, date, max_grade, weight FROM exams
         WHERE course_id IN ({}) AND date >= ?
         ORDER BY date LIMIT ?",
        placeholders
    );
    let mut bind: Vec<Value> = course_ids.iter().map(|id| Value::Text(id.clone())).collect();
    bind.push(Value::Text(from_day.to_string()));
    bind.push(Value::Integer(UPCOMING_LIMIT));

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    stmt.query_map(params_from_iter(bind), |r| {
        Ok(json!({
            "examId": r.get::<_, String>(0)?,
            "courseId": r.get::<_, String>(1)?,
            "title": r.get::<_, String>(2)?,
            "date": r.get::<_, String>(3)?,
            "maxGrade": r.get::<_, f64>(4)?,
            "weight": r.get::<_, f64>(5)?,
        }))
    })
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(|e| HandlerErr::db("db_query_failed", e))
}

fn student_dashboard(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;
    let from_day = reference_day(params)?;

    let course_name: Option<String> = conn
        .query_row(
            "SELECT course_name FROM users WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(course_name) = course_name else {
        return Err(HandlerErr::not_found("student not found"));
    };

    let attendance_stats = attendance::compute_stats(conn, &student_id, None)?;

    // The profile carries a course name; resolve it to a catalogue id when
    // one exists so the schedule can be scoped.
    let course_id: Option<String> = if course_name.is_empty() {
        None
    } else {
        conn.query_row(
            "SELECT id FROM courses WHERE name = ? LIMIT 1",
            [&course_name],
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
    };
    let course_ids: Vec<String> = course_id.into_iter().collect();

    let next_lessons = upcoming_lessons(conn, &course_ids, &from_day)?;
    let next_exams = upcoming_exams(conn, &course_ids, &from_day)?;

    let mut stmt = conn
        .prepare(
            "SELECT id, course_name, score, max_score, weight, category, occurred_on
             FROM grades WHERE student_id = ?
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let recent_grades = stmt
        .query_map((&student_id, RECENT_GRADES_LIMIT), |r| {
            Ok(json!({
                "gradeId": r.get::<_, String>(0)?,
                "courseName": r.get::<_, String>(1)?,
                "score": r.get::<_, f64>(2)?,
                "maxScore": r.get::<_, f64>(3)?,
                "weight": r.get::<_, f64>(4)?,
                "category": r.get::<_, String>(5)?,
                "occurredOn": r.get::<_, String>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let summary = grades::compute_summary(conn, &student_id, None)?;

    Ok(json!({
        "attendanceStats": attendance_stats,
        "nextLessons": next_lessons,
        "nextExams": next_exams,
        "recentGrades": recent_grades,
        "overallAverage": summary.weighted_average,
        "gradeCount": summary.count,
    }))
}

fn teacher_dashboard(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let from_day = reference_day(params)?;

    let teacher_name: Option<String> = conn
        .query_row("SELECT name FROM users WHERE id = ?", [&teacher_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let Some(teacher_name) = teacher_name else {
        return Err(HandlerErr::not_found("teacher not found"));
    };

    // Courses are tied to the teacher by display name, as filed on the course.
    let mut stmt = conn
        .prepare("SELECT id, name, code FROM courses WHERE professor_name = ? ORDER BY name")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let courses = stmt
        .query_map([&teacher_name], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let course_ids: Vec<String> = courses.iter().map(|(id, _, _)| id.clone()).collect();
    let next_lessons = upcoming_lessons(conn, &course_ids, &from_day)?;
    let next_exams = upcoming_exams(conn, &course_ids, &from_day)?;

    let mut course_stats: Vec<serde_json::Value> = Vec::new();
    for (course_id, name, code) in &courses {
        let students_count = declared_student_count(conn, name)?;
        let summary = course_grade_summary(conn, course_id)?;
        course_stats.push(json!({
            "course": { "courseId": course_id, "name": name, "code": code },
            "studentsCount": students_count,
            "gradesAverage": summary.weighted_average,
        }));
    }

    Ok(json!({
        "nextLessons": next_lessons,
        "nextExams": next_exams,
        "courseStats": course_stats,
        "totalCourses": courses.len(),
    }))
}

fn admin_dashboard(conn: &Connection, _params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let count_role = |role: &str| -> Result<i64, HandlerErr> {
        conn.query_row("SELECT COUNT(*) FROM users WHERE role = ?", [role], |r| {
            r.get(0)
        })
        .map_err(|e| HandlerErr::db("db_query_failed", e))
    };
    let students = count_role("student")?;
    let teachers = count_role("teacher")?;
    let admins = count_role("admin")?;

    let courses_count: i64 = conn
        .query_row("SELECT COUNT(*) FROM courses", [], |r| r.get(0))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut stmt = conn
        .prepare("SELECT score, max_score, weight FROM grades")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let grade_rows = stmt
        .query_map([], |r| {
            Ok(GradeRow {
                score: r.get(0)?,
                max_score: r.get(1)?,
                weight: r.get(2)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let grade_summary = stats::grade_summary(grade_rows);

    let mut stmt = conn
        .prepare("SELECT status, COUNT(*) FROM attendance GROUP BY status")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let status_counts = stmt
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut present = 0i64;
    let mut absent = 0i64;
    let mut late = 0i64;
    let mut excused = 0i64;
    for (status, count) in status_counts {
        match status.as_str() {
            "present" => present = count,
            "absent" => absent = count,
            "late" => late = count,
            "excused" => excused = count,
            _ => {}
        }
    }

    let mut stmt = conn
        .prepare("SELECT id, name, code FROM courses")
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let all_courses = stmt
        .query_map([], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let mut popular: Vec<(i64, serde_json::Value)> = Vec::new();
    for (course_id, name, code) in &all_courses {
        let students_count = declared_student_count(conn, name)?;
        popular.push((
            students_count,
            json!({
                "courseId": course_id,
                "name": name,
                "code": code,
                "studentsCount": students_count,
            }),
        ));
    }
    popular.sort_by(|a, b| b.0.cmp(&a.0));
    popular.truncate(POPULAR_COURSES_LIMIT);
    let popular_courses: Vec<serde_json::Value> =
        popular.into_iter().map(|(_, course)| course).collect();

    Ok(json!({
        "usersStats": {
            "students": students,
            "teachers": teachers,
            "admins": admins,
            "total": students + teachers + admins,
        },
        "coursesCount": courses_count,
        "gradesAverage": grade_summary.weighted_average,
        "attendanceStats": {
            "present": present,
            "absent": absent,
            "late": late,
            "excused": excused,
            // Legacy reports read excused absences under both keys.
            "justified": excused,
        },
        "popularCourses": popular_courses,
    }))
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
        "dashboard.student" => Some(dispatch(state, req, student_dashboard)),
        "dashboard.teacher" => Some(dispatch(state, req, teacher_dashboard)),
        "dashboard.admin" => Some(dispatch(state, req, admin_dashboard)),
        _ => None,
    }
}
