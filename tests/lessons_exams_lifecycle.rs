use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .expect("error code")
}

fn create_course(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    name: &str,
    code: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        id,
        "courses.create",
        json!({
            "name": name,
            "code": code,
            "credits": 3,
            "professorName": "Omar Brito",
            "schedule": "Tue 16:00",
            "room": "F1",
            "semester": 4
        }),
    );
    created
        .get("courseId")
        .and_then(|v| v.as_str())
        .expect("courseId")
        .to_string()
}

#[test]
fn lessons_crud_and_upcoming_filter() {
    let workspace = temp_dir("campusd-lessons");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course_id = create_course(&mut stdin, &mut reader, "2", "Astronomy", "AST101");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "lessons.create",
        json!({
            "courseId": course_id,
            "title": "Telescopes",
            "date": "2026-04-07",
            "resources": ["slides.pdf", "lab-sheet.pdf"]
        }),
    );
    let lesson_id = created
        .get("lessonId")
        .and_then(|v| v.as_str())
        .expect("lessonId")
        .to_string();
    assert_eq!(
        created.get("resources").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "lessons.create",
        json!({ "courseId": course_id, "title": "Star Charts", "date": "2026-03-01" }),
    );

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "lessons.listByCourse",
        json!({ "courseId": course_id }),
    );
    assert_eq!(all.get("count").and_then(|v| v.as_u64()), Some(2));

    let upcoming = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "lessons.listByCourse",
        json!({ "courseId": course_id, "from": "2026-04-01" }),
    );
    assert_eq!(upcoming.get("count").and_then(|v| v.as_u64()), Some(1));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "lessons.update",
        json!({ "lessonId": lesson_id, "title": "Telescopes and Optics" }),
    );
    assert_eq!(
        updated.get("title").and_then(|v| v.as_str()),
        Some("Telescopes and Optics")
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "lessons.delete",
        json!({ "lessonId": lesson_id }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "9",
        "lessons.delete",
        json!({ "lessonId": lesson_id }),
    );
    assert_eq!(error_code(&resp), "not_found");

    let resp = request(
        &mut stdin,
        &mut reader,
        "10",
        "lessons.listByCourse",
        json!({ "courseId": "no-such-course" }),
    );
    assert_eq!(error_code(&resp), "not_found");
}

#[test]
fn exams_validate_weight_and_max_grade() {
    let workspace = temp_dir("campusd-exams");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course_id = create_course(&mut stdin, &mut reader, "2", "Geology", "GEO120");

    let resp = request(
        &mut stdin,
        &mut reader,
        "3",
        "exams.create",
        json!({ "courseId": course_id, "title": "Quiz", "date": "2026-05-05", "weight": 1.5 }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let resp = request(
        &mut stdin,
        &mut reader,
        "4",
        "exams.create",
        json!({ "courseId": course_id, "title": "Quiz", "date": "2026-05-05", "maxGrade": 0 }),
    );
    assert_eq!(error_code(&resp), "bad_params");

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "exams.create",
        json!({ "courseId": course_id, "title": "Field Exam", "date": "2026-05-12" }),
    );
    let exam_id = created
        .get("examId")
        .and_then(|v| v.as_str())
        .expect("examId")
        .to_string();
    assert_eq!(created.get("maxGrade").and_then(|v| v.as_f64()), Some(100.0));
    assert_eq!(created.get("weight").and_then(|v| v.as_f64()), Some(0.3));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "exams.update",
        json!({ "examId": exam_id, "weight": 0.5, "date": "2026-05-19" }),
    );
    assert_eq!(updated.get("weight").and_then(|v| v.as_f64()), Some(0.5));
    assert_eq!(
        updated.get("date").and_then(|v| v.as_str()),
        Some("2026-05-19")
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "exams.listByCourse",
        json!({ "courseId": course_id, "from": "2026-05-15" }),
    );
    assert_eq!(listed.get("count").and_then(|v| v.as_u64()), Some(1));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "exams.delete",
        json!({ "examId": exam_id }),
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "exams.listByCourse",
        json!({ "courseId": course_id }),
    );
    assert_eq!(listed.get("count").and_then(|v| v.as_u64()), Some(0));
}
