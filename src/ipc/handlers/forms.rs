use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    let raw = req
        .params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))?;
    if raw.is_empty() {
        return Err(err(
            &req.id,
            "bad_params",
            format!("{} must not be empty", key),
            None,
        ));
    }
    Ok(raw)
}

fn handle_forms_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let department_id = req
        .params
        .get("departmentId")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let sql = "SELECT
                 f.id,
                 f.department_id,
                 f.title,
                 f.deadline,
                 f.created_at,
                 (SELECT COUNT(*) FROM form_questions q WHERE q.form_id = f.id) AS question_count,
                 (SELECT COUNT(*) FROM responses r WHERE r.form_id = f.id) AS response_count
               FROM forms f
               WHERE (?1 IS NULL OR f.department_id = ?1)
               ORDER BY f.created_at, f.rowid";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&department_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "departmentId": row.get::<_, String>(1)?,
                "title": row.get::<_, String>(2)?,
                "deadline": row.get::<_, Option<String>>(3)?,
                "createdAt": row.get::<_, String>(4)?,
                "questionCount": row.get::<_, i64>(5)?,
                "responseCount": row.get::<_, i64>(6)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(forms) => ok(&req.id, json!({ "forms": forms })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_forms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let department_id = match required_str(req, "departmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let deadline = req
        .params
        .get("deadline")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let Some(questions) = req.params.get("questions").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing questions", None);
    };
    let question_texts: Vec<String> = questions
        .iter()
        .filter_map(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if question_texts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "questions must contain at least one non-empty text",
            None,
        );
    }

    let department_known: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM departments WHERE id = ?",
            [&department_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if department_known.is_none() {
        return err(&req.id, "not_found", "department not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let form_id = Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339();
    if let Err(e) = tx.execute(
        "INSERT INTO forms(id, department_id, title, deadline, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&form_id, &department_id, &title, &deadline, &created_at),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "forms" })),
        );
    }

    let mut question_ids = Vec::with_capacity(question_texts.len());
    for (idx, text) in question_texts.iter().enumerate() {
        let question_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO form_questions(id, form_id, idx, text) VALUES(?, ?, ?, ?)",
            (&question_id, &form_id, idx as i64, text),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "form_questions" })),
            );
        }
        question_ids.push(question_id);
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "formId": form_id, "questionIds": question_ids }),
    )
}

fn handle_forms_questions(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let form_id = match required_str(req, "formId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut stmt = match conn.prepare(
        "SELECT id, idx, text FROM form_questions WHERE form_id = ? ORDER BY idx",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&form_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "idx": row.get::<_, i64>(1)?,
                "text": row.get::<_, String>(2)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(questions) => ok(&req.id, json!({ "questions": questions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "forms.list" => Some(handle_forms_list(state, req)),
        "forms.create" => Some(handle_forms_create(state, req)),
        "forms.questions" => Some(handle_forms_questions(state, req)),
        _ => None,
    }
}
