use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

// Answers keep the portal's tolerant typing: questionId may be blank and
// response may be a number, a string, or null. Blank ids are stored and
// later dropped by the normalizer, matching the original behavior.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmittedAnswer {
    #[serde(default)]
    question_id: String,
    #[serde(default)]
    response: serde_json::Value,
    #[serde(default)]
    comments: Option<String>,
}

fn form_exists(
    conn: &Connection,
    req: &Request,
    form_id: &str,
) -> Result<bool, serde_json::Value> {
    conn.query_row("SELECT 1 FROM forms WHERE id = ?", [form_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| err(&req.id, "db_query_failed", e.to_string(), None))
}

fn question_text_for(conn: &Connection, form_id: &str, question_id: &str) -> Option<String> {
    conn.query_row(
        "SELECT text FROM form_questions WHERE form_id = ? AND id = ?",
        (form_id, question_id),
        |r| r.get(0),
    )
    .optional()
    .ok()
    .flatten()
}

fn handle_responses_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let form_id = match required_str(req, "formId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(answers_raw) = req.params.get("answers") else {
        return err(&req.id, "bad_params", "missing answers", None);
    };
    let answers: Vec<SubmittedAnswer> = match serde_json::from_value(answers_raw.clone()) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("answers must be a list of answer objects: {}", e),
                None,
            )
        }
    };
    let submitted_at = req
        .params
        .get("submittedAt")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Utc::now().to_rfc3339());

    match form_exists(conn, req, &form_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "form not found", None),
        Err(resp) => return resp,
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let response_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO responses(id, form_id, submitted_at) VALUES(?, ?, ?)",
        (&response_id, &form_id, &submitted_at),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "responses" })),
        );
    }

    for (idx, answer) in answers.iter().enumerate() {
        // Resolve the question text at ingest so results survive later
        // edits to the form; blank when the id is unknown.
        let question_text = question_text_for(&tx, &form_id, &answer.question_id)
            .unwrap_or_default();
        let response_raw = answer.response.to_string();
        let answer_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO response_answers(id, response_id, idx, question_id, question_text, response_raw, comments)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &answer_id,
                &response_id,
                idx as i64,
                &answer.question_id,
                &question_text,
                &response_raw,
                &answer.comments,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "response_answers" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "responseId": response_id, "answerCount": answers.len() }),
    )
}

fn handle_responses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let form_id = match required_str(req, "formId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let raw = match super::feedback::load_raw_responses(conn, &form_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let responses: Vec<serde_json::Value> = raw
        .iter()
        .map(|r| {
            json!({
                "responseId": r.response_id,
                "submittedAt": r.submitted_at,
                "answers": r.answers.iter().map(|a| json!({
                    "questionId": a.question_id,
                    "questionText": a.question_text,
                    "response": a.response,
                    "comments": a.comments
                })).collect::<Vec<_>>()
            })
        })
        .collect();

    ok(&req.id, json!({ "responses": responses }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "responses.submit" => Some(handle_responses_submit(state, req)),
        "responses.list" => Some(handle_responses_list(state, req)),
        _ => None,
    }
}
