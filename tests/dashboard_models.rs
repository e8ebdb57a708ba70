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

fn str_field(value: &serde_json::Value, key: &str) -> String {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {}", key))
        .to_string()
}

#[test]
fn student_dashboard_combines_schedule_grades_and_attendance() {
    let workspace = temp_dir("campusd-dash-student");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({
            "name": "Software Engineering",
            "code": "SE400",
            "credits": 6,
            "professorName": "Clara Dias",
            "schedule": "Mon 08:00",
            "room": "D4",
            "semester": 7
        }),
    );
    let course_id = str_field(&course, "courseId");

    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "users.create",
        json!({
            "name": "Wagner Leal",
            "email": "wagner@campus.edu",
            "role": "student",
            "courseName": "Software Engineering"
        }),
    );
    let student_id = str_field(&student, "userId");

    // One lesson behind the reference date, two ahead; only the two show up.
    for (i, date) in ["2026-02-02", "2026-06-01", "2026-06-08"].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("l{}", i),
            "lessons.create",
            json!({
                "courseId": course_id,
                "title": format!("Lecture {}", i + 1),
                "date": date
            }),
        );
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "e1",
        "exams.create",
        json!({
            "courseId": course_id,
            "title": "Midterm",
            "date": "2026-06-15",
            "maxGrade": 100,
            "weight": 0.4
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.create",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "score": 70,
            "weight": 0.5,
            "category": "assignment"
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "grades.create",
        json!({
            "studentId": student_id,
            "courseId": course_id,
            "score": 90,
            "weight": 0.5,
            "category": "exam"
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "attendance.recordBatch",
        json!({
            "courseId": course_id,
            "day": "2026-05-18",
            "items": [{ "studentId": student_id, "status": "present" }]
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "a2",
        "attendance.recordBatch",
        json!({
            "courseId": course_id,
            "day": "2026-05-19",
            "items": [{ "studentId": student_id, "status": "absent" }]
        }),
    );

    let dash = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "dashboard.student",
        json!({ "studentId": student_id, "today": "2026-05-20" }),
    );

    let next_lessons = dash.get("nextLessons").and_then(|v| v.as_array()).expect("nextLessons");
    assert_eq!(next_lessons.len(), 2);
    assert_eq!(
        next_lessons[0].get("date").and_then(|v| v.as_str()),
        Some("2026-06-01")
    );
    let next_exams = dash.get("nextExams").and_then(|v| v.as_array()).expect("nextExams");
    assert_eq!(next_exams.len(), 1);

    assert_eq!(dash.get("overallAverage").and_then(|v| v.as_f64()), Some(80.0));
    assert_eq!(dash.get("gradeCount").and_then(|v| v.as_u64()), Some(2));

    let att = dash.get("attendanceStats").expect("attendanceStats");
    assert_eq!(att.get("total").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(att.get("rate").and_then(|v| v.as_f64()), Some(50.0));

    let recent = dash.get("recentGrades").and_then(|v| v.as_array()).expect("recentGrades");
    assert_eq!(recent.len(), 2);
}

#[test]
fn teacher_dashboard_aggregates_per_course() {
    let workspace = temp_dir("campusd-dash-teacher");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "users.create",
        json!({ "name": "Clara Dias", "email": "clara@campus.edu", "role": "teacher" }),
    );
    let teacher_id = str_field(&teacher, "userId");

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({
            "name": "Robotics",
            "code": "ROB330",
            "credits": 5,
            "professorName": "Clara Dias",
            "schedule": "Thu 13:00",
            "room": "Lab 7",
            "semester": 6
        }),
    );
    let course_id = str_field(&course, "courseId");
    // A course taught by someone else must not appear.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "courses.create",
        json!({
            "name": "Ethics",
            "code": "ETH101",
            "credits": 2,
            "professorName": "Someone Else",
            "schedule": "Fri 09:00",
            "room": "A1",
            "semester": 1
        }),
    );

    // Two students declare the course on their profile, one declares another.
    for (i, (name, email, declared)) in [
        ("Yara Campos", "yara@campus.edu", "Robotics"),
        ("Zeca Moraes", "zeca@campus.edu", "Robotics"),
        ("Alba Faria", "alba@campus.edu", "Ethics"),
    ]
    .iter()
    .enumerate()
    {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("s{}", i),
            "users.create",
            json!({ "name": name, "email": email, "role": "student", "courseName": declared }),
        );
        let sid = str_field(&created, "userId");
        if *declared == "Robotics" {
            let _ = request_ok(
                &mut stdin,
                &mut reader,
                &format!("g{}", i),
                "grades.create",
                json!({
                    "studentId": sid,
                    "courseId": course_id,
                    "score": 80,
                    "weight": 0.5,
                    "category": "project"
                }),
            );
        }
    }

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "lessons.create",
        json!({ "courseId": course_id, "title": "Actuators", "date": "2026-06-04" }),
    );

    let dash = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "dashboard.teacher",
        json!({ "teacherId": teacher_id, "today": "2026-06-01" }),
    );

    assert_eq!(dash.get("totalCourses").and_then(|v| v.as_u64()), Some(1));
    let stats = dash.get("courseStats").and_then(|v| v.as_array()).expect("courseStats");
    assert_eq!(stats.len(), 1);
    assert_eq!(
        stats[0].get("studentsCount").and_then(|v| v.as_u64()),
        Some(2)
    );
    assert_eq!(
        stats[0].get("gradesAverage").and_then(|v| v.as_f64()),
        Some(80.0)
    );
    let next_lessons = dash.get("nextLessons").and_then(|v| v.as_array()).expect("nextLessons");
    assert_eq!(next_lessons.len(), 1);
}

#[test]
fn admin_dashboard_counts_and_justified_mirror() {
    let workspace = temp_dir("campusd-dash-admin");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let mut student_ids = Vec::new();
    for (i, (name, email, role, declared)) in [
        ("Bia Serra", "bia@campus.edu", "student", "History"),
        ("Caua Ramos", "caua@campus.edu", "student", "History"),
        ("Davi Melo", "davi@campus.edu", "teacher", ""),
        ("Eva Cunha", "eva@campus.edu", "admin", ""),
    ]
    .iter()
    .enumerate()
    {
        let created = request_ok(
            &mut stdin,
            &mut reader,
            &format!("u{}", i),
            "users.create",
            json!({ "name": name, "email": email, "role": role, "courseName": declared }),
        );
        if *role == "student" {
            student_ids.push(str_field(&created, "userId"));
        }
    }

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "courses.create",
        json!({
            "name": "History",
            "code": "HIS100",
            "credits": 3,
            "professorName": "Davi Melo",
            "schedule": "Tue 10:00",
            "room": "B2",
            "semester": 1
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "c2",
        "courses.create",
        json!({
            "name": "Latin",
            "code": "LAT100",
            "credits": 2,
            "professorName": "Davi Melo",
            "schedule": "Tue 14:00",
            "room": "B3",
            "semester": 1
        }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.create",
        json!({
            "studentId": student_ids[0],
            "courseName": "History",
            "score": 100,
            "weight": 0.5,
            "category": "exam"
        }),
    );

    for (i, status) in ["present", "excused", "excused"].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("a{}", i),
            "attendance.create",
            json!({
                "studentId": student_ids[i % 2],
                "courseName": "History",
                "day": format!("2026-03-{:02}", i + 2),
                "status": status
            }),
        );
    }

    let dash = request_ok(&mut stdin, &mut reader, "9", "dashboard.admin", json!({}));

    let users_stats = dash.get("usersStats").expect("usersStats");
    assert_eq!(users_stats.get("students").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(users_stats.get("teachers").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(users_stats.get("admins").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(users_stats.get("total").and_then(|v| v.as_u64()), Some(4));

    assert_eq!(dash.get("coursesCount").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(dash.get("gradesAverage").and_then(|v| v.as_f64()), Some(100.0));

    let att = dash.get("attendanceStats").expect("attendanceStats");
    assert_eq!(att.get("present").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(att.get("excused").and_then(|v| v.as_u64()), Some(2));
    // Legacy report shape: excused absences counted under both keys.
    assert_eq!(att.get("justified").and_then(|v| v.as_u64()), Some(2));

    let popular = dash.get("popularCourses").and_then(|v| v.as_array()).expect("popularCourses");
    assert_eq!(popular.len(), 2);
    assert_eq!(popular[0].get("name").and_then(|v| v.as_str()), Some("History"));
    assert_eq!(
        popular[0].get("studentsCount").and_then(|v| v.as_u64()),
        Some(2)
    );
}
