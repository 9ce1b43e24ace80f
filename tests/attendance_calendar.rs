mod test_support;

use serde_json::json;
use test_support::{
    open_workspace_with_department, request_err, request_ok, spawn_sidecar, temp_dir,
};

fn add_student(
    stdin: &mut std::process::ChildStdin,
    reader: &mut std::io::BufReader<std::process::ChildStdout>,
    department_id: &str,
    last: &str,
    first: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("student-{}-{}", last, first),
        "students.create",
        json!({ "departmentId": department_id, "lastName": last, "firstName": first }),
    );
    created
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

#[test]
fn taken_day_aggregates_and_untaken_day_is_absent() {
    let workspace = temp_dir("feedbackd-attendance-day");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let cs = open_workspace_with_department(&mut stdin, &mut reader, &workspace, "CS");

    let s1 = add_student(&mut stdin, &mut reader, &cs, "Adams", "Ada");
    let s2 = add_student(&mut stdin, &mut reader, &cs, "Byrne", "Bo");
    let s3 = add_student(&mut stdin, &mut reader, &cs, "Cheng", "Cai");

    let recorded = request_ok(
        &mut stdin,
        &mut reader,
        "record",
        "attendance.record",
        json!({
            "departmentId": cs,
            "date": "2024-03-01",
            "entries": [
                { "studentId": s1, "status": "present" },
                { "studentId": s2, "status": "present" },
                { "studentId": s3, "status": "absent" }
            ]
        }),
    );
    assert_eq!(recorded.get("markedCount").and_then(|v| v.as_u64()), Some(3));

    let calendar = request_ok(
        &mut stdin,
        &mut reader,
        "calendar",
        "attendance.calendar",
        json!({ "month": "2024-03", "departmentId": cs }),
    );
    let days = calendar.get("days").and_then(|v| v.as_array()).expect("days");
    // Only the taken day appears; 2024-03-02 must have no entry at all.
    assert_eq!(days.len(), 1);
    let day = &days[0];
    assert_eq!(day.get("date").and_then(|v| v.as_str()), Some("2024-03-01"));
    assert_eq!(day.get("present").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(day.get("absent").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(day.get("late").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(day.get("excused").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(day.get("total").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(day.get("presentPercent").and_then(|v| v.as_f64()), Some(66.7));
}

#[test]
fn departments_sharing_a_date_stay_separate() {
    let workspace = temp_dir("feedbackd-attendance-depts");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let cs = open_workspace_with_department(&mut stdin, &mut reader, &workspace, "CS");
    let ee = request_ok(
        &mut stdin,
        &mut reader,
        "dep-ee",
        "departments.create",
        json!({ "name": "EE" }),
    )
    .get("departmentId")
    .and_then(|v| v.as_str())
    .unwrap()
    .to_string();

    let cs_student = add_student(&mut stdin, &mut reader, &cs, "Adams", "Ada");
    let ee_student = add_student(&mut stdin, &mut reader, &ee, "Volt", "Eva");

    for (dep, student, status) in [(&cs, &cs_student, "present"), (&ee, &ee_student, "late")] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("record-{}", status),
            "attendance.record",
            json!({
                "departmentId": dep,
                "date": "2024-03-04",
                "entries": [{ "studentId": student, "status": status }]
            }),
        );
    }

    // Unfiltered view keeps one entry per (date, department).
    let calendar = request_ok(
        &mut stdin,
        &mut reader,
        "calendar",
        "attendance.calendar",
        json!({ "month": "2024-03" }),
    );
    let days = calendar.get("days").and_then(|v| v.as_array()).unwrap();
    assert_eq!(days.len(), 2);
    assert!(days.iter().all(|d| d.get("date").and_then(|v| v.as_str()) == Some("2024-03-04")));

    // Filtering narrows to one department.
    let filtered = request_ok(
        &mut stdin,
        &mut reader,
        "calendar-cs",
        "attendance.calendar",
        json!({ "month": "2024-03", "departmentId": cs }),
    );
    let filtered_days = filtered.get("days").and_then(|v| v.as_array()).unwrap();
    assert_eq!(filtered_days.len(), 1);
    assert_eq!(
        filtered_days[0].get("departmentName").and_then(|v| v.as_str()),
        Some("CS")
    );
}

#[test]
fn retaking_a_day_replaces_previous_marks() {
    let workspace = temp_dir("feedbackd-attendance-retake");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let cs = open_workspace_with_department(&mut stdin, &mut reader, &workspace, "CS");
    let s1 = add_student(&mut stdin, &mut reader, &cs, "Adams", "Ada");

    for status in ["absent", "excused"] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("record-{}", status),
            "attendance.record",
            json!({
                "departmentId": cs,
                "date": "2024-03-05",
                "entries": [{ "studentId": s1, "status": status, "remark": "doctor's note" }]
            }),
        );
    }

    let calendar = request_ok(
        &mut stdin,
        &mut reader,
        "calendar",
        "attendance.calendar",
        json!({ "month": "2024-03", "departmentId": cs }),
    );
    let day = &calendar.get("days").and_then(|v| v.as_array()).unwrap()[0];
    assert_eq!(day.get("absent").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(day.get("excused").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(day.get("total").and_then(|v| v.as_u64()), Some(1));
}

#[test]
fn unknown_status_is_rejected_whole() {
    let workspace = temp_dir("feedbackd-attendance-status");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let cs = open_workspace_with_department(&mut stdin, &mut reader, &workspace, "CS");
    let s1 = add_student(&mut stdin, &mut reader, &cs, "Adams", "Ada");

    let error = request_err(
        &mut stdin,
        &mut reader,
        "bad-record",
        "attendance.record",
        json!({
            "departmentId": cs,
            "date": "2024-03-06",
            "entries": [
                { "studentId": s1, "status": "present" },
                { "studentId": s1, "status": "vacation" }
            ]
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    // The valid first entry must not have been written either.
    let calendar = request_ok(
        &mut stdin,
        &mut reader,
        "calendar",
        "attendance.calendar",
        json!({ "month": "2024-03", "departmentId": cs }),
    );
    assert_eq!(
        calendar.get("days").and_then(|v| v.as_array()).map(|d| d.len()),
        Some(0)
    );
}

#[test]
fn range_summary_sums_departments_explicitly() {
    let workspace = temp_dir("feedbackd-attendance-summary");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let cs = open_workspace_with_department(&mut stdin, &mut reader, &workspace, "CS");
    let s1 = add_student(&mut stdin, &mut reader, &cs, "Adams", "Ada");
    let s2 = add_student(&mut stdin, &mut reader, &cs, "Byrne", "Bo");

    for (date, statuses) in [
        ("2024-03-01", ["present", "present"]),
        ("2024-03-04", ["present", "absent"]),
    ] {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("record-{}", date),
            "attendance.record",
            json!({
                "departmentId": cs,
                "date": date,
                "entries": [
                    { "studentId": s1, "status": statuses[0] },
                    { "studentId": s2, "status": statuses[1] }
                ]
            }),
        );
    }

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "summary",
        "attendance.summary",
        json!({ "from": "2024-03-01", "to": "2024-03-31" }),
    );
    assert_eq!(summary.get("takenDays").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(summary.pointer("/totals/present").and_then(|v| v.as_u64()), Some(3));
    assert_eq!(summary.pointer("/totals/absent").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(summary.pointer("/totals/total").and_then(|v| v.as_u64()), Some(4));
    assert_eq!(
        summary.pointer("/totals/presentPercent").and_then(|v| v.as_f64()),
        Some(75.0)
    );
    assert_eq!(
        summary.pointer("/departments/0/departmentName").and_then(|v| v.as_str()),
        Some("CS")
    );
}
