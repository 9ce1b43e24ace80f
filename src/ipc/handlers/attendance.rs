use crate::agg;
use crate::ipc::error::{err, ok, stale};
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::new("bad_params", format!("missing {}", key)))
}

fn parse_day(raw: &str) -> Result<NaiveDate, HandlerErr> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| HandlerErr::new("bad_params", "date must be YYYY-MM-DD"))
}

fn parse_month_bounds(raw: &str) -> Result<(NaiveDate, NaiveDate), HandlerErr> {
    let bad = || HandlerErr::new("bad_params", "month must be YYYY-MM");
    let Some((y, m)) = raw.trim().split_once('-') else {
        return Err(bad());
    };
    let year: i32 = y.parse().map_err(|_| bad())?;
    let month: u32 = m.parse().map_err(|_| bad())?;
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(bad)?;
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let next_first = NaiveDate::from_ymd_opt(next_year, next_month, 1).ok_or_else(bad)?;
    Ok((first, next_first))
}

fn department_exists(conn: &Connection, department_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM departments WHERE id = ?",
        [department_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(HandlerErr::db)
}

fn department_names(conn: &Connection) -> Result<HashMap<String, String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT id, name FROM departments")
        .map_err(HandlerErr::db)?;
    stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })
    .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
    .map_err(HandlerErr::db)
}

/// Loads raw records in [from, to) keyed by department id, entries included.
fn load_records(
    conn: &Connection,
    from: NaiveDate,
    to: NaiveDate,
    department_id: Option<&str>,
) -> Result<Vec<agg::RawAttendanceRecord>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT id, department_id, date
             FROM attendance_records
             WHERE date >= ?1 AND date < ?2 AND (?3 IS NULL OR department_id = ?3)
             ORDER BY date, department_id",
        )
        .map_err(HandlerErr::db)?;
    let header_rows = stmt
        .query_map(
            (from.to_string(), to.to_string(), department_id),
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    let mut records = Vec::with_capacity(header_rows.len());
    let mut index: HashMap<String, usize> = HashMap::new();
    for (id, dep, date_raw) in header_rows {
        let date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
            .map_err(|_| HandlerErr::new("db_query_failed", "stored date is not YYYY-MM-DD"))?;
        index.insert(id.clone(), records.len());
        records.push(agg::RawAttendanceRecord {
            record_id: id,
            department: dep,
            date,
            attendees: Vec::new(),
        });
    }

    let mut entries_stmt = conn
        .prepare(
            "SELECT e.record_id, e.student_id, e.status, e.remark
             FROM attendance_entries e
             JOIN attendance_records r ON r.id = e.record_id
             WHERE r.date >= ?1 AND r.date < ?2 AND (?3 IS NULL OR r.department_id = ?3)",
        )
        .map_err(HandlerErr::db)?;
    let entry_rows = entries_stmt
        .query_map(
            (from.to_string(), to.to_string(), department_id),
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::db)?;

    for (record_id, student_id, status_raw, remark) in entry_rows {
        let Some(&slot) = index.get(&record_id) else {
            continue;
        };
        // Statuses are validated at ingest; anything else in an old
        // workspace row is dropped rather than miscounted.
        let Some(status) = agg::AttendanceStatus::parse(&status_raw) else {
            continue;
        };
        records[slot].attendees.push(agg::AttendeeMark {
            student_id,
            status,
            remark,
        });
    }

    Ok(records)
}

fn attendance_record(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let department_id = get_required_str(params, "departmentId")?;
    let date = parse_day(&get_required_str(params, "date")?)?;
    let Some(entries_json) = params.get("entries").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::new("bad_params", "missing entries"));
    };

    // Parse fully before touching the database so a bad status cannot leave
    // a half-written day behind.
    let mut entries: Vec<(String, agg::AttendanceStatus, Option<String>)> = Vec::new();
    for e in entries_json {
        let student_id = e
            .get("studentId")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr::new("bad_params", "entry missing studentId"))?;
        let status_raw = e
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or_else(|| HandlerErr::new("bad_params", "entry missing status"))?;
        let status = agg::AttendanceStatus::parse(status_raw).ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: "status must be one of: present, absent, late, excused".to_string(),
            details: Some(json!({ "status": status_raw })),
        })?;
        let remark = e
            .get("remark")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        entries.push((student_id, status, remark));
    }

    if !department_exists(conn, &department_id)? {
        return Err(HandlerErr::new("not_found", "department not found"));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT id FROM attendance_records WHERE department_id = ? AND date = ?",
            (&department_id, date.to_string()),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let record_id = match existing {
        Some(id) => {
            // Re-taking attendance for a day replaces the previous marks.
            tx.execute("DELETE FROM attendance_entries WHERE record_id = ?", [&id])
                .map_err(|e| HandlerErr {
                    code: "db_delete_failed",
                    message: e.to_string(),
                    details: Some(json!({ "table": "attendance_entries" })),
                })?;
            id
        }
        None => {
            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO attendance_records(id, department_id, date) VALUES(?, ?, ?)",
                (&id, &department_id, date.to_string()),
            )
            .map_err(|e| HandlerErr {
                code: "db_insert_failed",
                message: e.to_string(),
                details: Some(json!({ "table": "attendance_records" })),
            })?;
            id
        }
    };

    let mut written = 0usize;
    for (student_id, status, remark) in &entries {
        let known = tx
            .query_row(
                "SELECT 1 FROM students WHERE id = ? AND department_id = ?",
                (student_id, &department_id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map_err(HandlerErr::db)?
            .is_some();
        if !known {
            continue;
        }
        tx.execute(
            "INSERT INTO attendance_entries(record_id, student_id, status, remark)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(record_id, student_id) DO UPDATE SET
               status = excluded.status,
               remark = excluded.remark",
            (&record_id, student_id, status.as_str(), remark),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: Some(json!({ "table": "attendance_entries" })),
        })?;
        written += 1;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({
        "recordId": record_id,
        "date": date.to_string(),
        "markedCount": written
    }))
}

fn day_to_json(
    key: &agg::DayKey,
    aggregate: &agg::AttendanceDayAggregate,
    names: &HashMap<String, String>,
) -> serde_json::Value {
    let (date, department_id) = key;
    json!({
        "date": date.to_string(),
        "departmentId": department_id,
        "departmentName": names.get(department_id).cloned().unwrap_or_default(),
        "present": aggregate.present,
        "absent": aggregate.absent,
        "late": aggregate.late,
        "excused": aggregate.excused,
        "total": aggregate.total,
        "presentPercent": agg::round_off_1_decimal(aggregate.present_percent())
    })
}

fn attendance_calendar(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let month = get_required_str(params, "month")?;
    let (first, next_first) = parse_month_bounds(&month)?;
    let department_id = params
        .get("departmentId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let records = load_records(conn, first, next_first, department_id.as_deref())?;
    let aggregates = agg::aggregate_attendance(&records, department_id.as_deref());
    let names = department_names(conn)?;

    // Only taken days appear; the shell renders missing days as "not taken".
    let days: Vec<serde_json::Value> = aggregates
        .iter()
        .map(|(key, aggregate)| day_to_json(key, aggregate, &names))
        .collect();

    Ok(json!({
        "month": month,
        "departmentId": department_id,
        "days": days
    }))
}

fn attendance_summary(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let from = parse_day(&get_required_str(params, "from")?)?;
    let to = parse_day(&get_required_str(params, "to")?)?;
    if to < from {
        return Err(HandlerErr::new("bad_params", "to must not precede from"));
    }
    let department_id = params
        .get("departmentId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let to_exclusive = to.succ_opt().unwrap_or(to);
    let records = load_records(conn, from, to_exclusive, department_id.as_deref())?;
    let aggregates = agg::aggregate_attendance(&records, department_id.as_deref());
    let names = department_names(conn)?;

    // Cross-department summing is this view's explicit choice, not something
    // the aggregator does behind the caller's back.
    let mut totals = agg::AttendanceDayAggregate::default();
    let mut per_department: HashMap<String, agg::AttendanceDayAggregate> = HashMap::new();
    for ((_, dep), aggregate) in &aggregates {
        totals.accumulate(aggregate);
        per_department
            .entry(dep.clone())
            .or_default()
            .accumulate(aggregate);
    }

    let mut department_rows: Vec<serde_json::Value> = per_department
        .iter()
        .map(|(dep, aggregate)| {
            json!({
                "departmentId": dep,
                "departmentName": names.get(dep).cloned().unwrap_or_default(),
                "present": aggregate.present,
                "absent": aggregate.absent,
                "late": aggregate.late,
                "excused": aggregate.excused,
                "total": aggregate.total,
                "presentPercent": agg::round_off_1_decimal(aggregate.present_percent())
            })
        })
        .collect();
    department_rows.sort_by(|a, b| {
        a["departmentName"]
            .as_str()
            .unwrap_or("")
            .cmp(b["departmentName"].as_str().unwrap_or(""))
    });

    Ok(json!({
        "from": from.to_string(),
        "to": to.to_string(),
        "takenDays": aggregates.len(),
        "totals": {
            "present": totals.present,
            "absent": totals.absent,
            "late": totals.late,
            "excused": totals.excused,
            "total": totals.total,
            "presentPercent": agg::round_off_1_decimal(totals.present_percent())
        },
        "departments": department_rows
    }))
}

fn handle_attendance_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_record(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_calendar(state: &mut AppState, req: &Request) -> serde_json::Value {
    let request_token = req.params.get("requestToken").and_then(|v| v.as_u64());
    if !state.guards.admit("attendance.calendar", request_token) {
        return stale(&req.id);
    }
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_calendar(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_attendance_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match attendance_summary(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.record" => Some(handle_attendance_record(state, req)),
        "attendance.calendar" => Some(handle_attendance_calendar(state, req)),
        "attendance.summary" => Some(handle_attendance_summary(state, req)),
        _ => None,
    }
}
