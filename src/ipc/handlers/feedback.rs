use crate::agg;
use crate::ipc::error::{err, ok, stale};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::collections::HashMap;

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

/// Raw submissions for a form in insertion order, answers in submission
/// order. `response_raw` is stored JSON text; rows that fail to re-parse
/// are treated as plain strings rather than dropped.
pub fn load_raw_responses(
    conn: &Connection,
    form_id: &str,
) -> Result<Vec<agg::RawFeedbackResponse>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, submitted_at FROM responses WHERE form_id = ? ORDER BY rowid",
    )?;
    let mut responses: Vec<agg::RawFeedbackResponse> = stmt
        .query_map([form_id], |row| {
            Ok(agg::RawFeedbackResponse {
                response_id: row.get(0)?,
                submitted_at: row.get(1)?,
                answers: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut index: HashMap<String, usize> = HashMap::new();
    for (i, r) in responses.iter().enumerate() {
        index.insert(r.response_id.clone(), i);
    }

    let mut answers_stmt = conn.prepare(
        "SELECT a.response_id, a.question_id, a.question_text, a.response_raw, a.comments
         FROM response_answers a
         JOIN responses r ON r.id = a.response_id
         WHERE r.form_id = ?
         ORDER BY r.rowid, a.idx",
    )?;
    let answer_rows = answers_stmt
        .query_map([form_id], |row| {
            let response_id: String = row.get(0)?;
            let question_id: String = row.get(1)?;
            let question_text: String = row.get(2)?;
            let response_raw: String = row.get(3)?;
            let comments: Option<String> = row.get(4)?;
            Ok((response_id, question_id, question_text, response_raw, comments))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    for (response_id, question_id, question_text, response_raw, comments) in answer_rows {
        let Some(&slot) = index.get(&response_id) else {
            continue;
        };
        let response = serde_json::from_str(&response_raw)
            .unwrap_or(serde_json::Value::String(response_raw));
        responses[slot].answers.push(agg::RawAnswer {
            question_id,
            question_text,
            response,
            comments,
        });
    }

    Ok(responses)
}

// Fill question texts that were blank at ingest (answer submitted against a
// question id unknown at the time, or a form edited since). The normalizer
// falls back to "Question <id>" for anything still unresolved.
fn resolve_question_texts(
    conn: &Connection,
    form_id: &str,
    responses: &mut [agg::RawFeedbackResponse],
) -> Result<(), rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT id, text FROM form_questions WHERE form_id = ? ORDER BY idx")?;
    let texts: HashMap<String, String> = stmt
        .query_map([form_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<Result<HashMap<_, _>, _>>()?;

    for response in responses.iter_mut() {
        for answer in response.answers.iter_mut() {
            if answer.question_text.trim().is_empty() {
                if let Some(text) = texts.get(&answer.question_id) {
                    answer.question_text = text.clone();
                }
            }
        }
    }
    Ok(())
}

fn aggregate_to_json(a: &agg::QuestionAggregate) -> serde_json::Value {
    json!({
        "questionId": a.question_id,
        "questionText": a.question_text,
        "averageRating": agg::round_off_1_decimal(a.average_rating),
        "responseCount": a.response_count,
        "totalCount": a.total_count
    })
}

fn handle_feedback_results(state: &mut AppState, req: &Request) -> serde_json::Value {
    let request_token = req.params.get("requestToken").and_then(|v| v.as_u64());
    if !state.guards.admit("feedback.results", request_token) {
        return stale(&req.id);
    }

    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let form_id = match required_str(req, "formId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let filter_question_id = req
        .params
        .get("filterQuestionId")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let mut raw = match load_raw_responses(conn, &form_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(e) = resolve_question_texts(conn, &form_id, &mut raw) {
        return err(&req.id, "db_query_failed", e.to_string(), None);
    }

    let buckets = agg::BucketTable::default();
    let normalized = agg::normalize(&raw);
    let (distribution, aggregates) = agg::aggregate_ratings(&normalized, &buckets);
    let chart_series = agg::build_chart_series(&distribution);
    let question_series = agg::build_question_series(&aggregates);
    let drilldown = agg::build_drilldown(&normalized, filter_question_id.as_deref());
    let top = agg::top_rated(&aggregates, 2);
    let bottom = agg::needs_improvement(&aggregates, 2);

    ok(
        &req.id,
        json!({
            "formId": form_id,
            "responseCount": raw.len(),
            "answerCount": normalized.len(),
            "ratedCount": agg::rated_count(&normalized),
            "hasRatings": distribution.total() > 0,
            "overallAverage": agg::round_off_1_decimal(agg::overall_average(&normalized)),
            "distribution": distribution,
            "questionAggregates": aggregates.iter().map(aggregate_to_json).collect::<Vec<_>>(),
            "chartSeries": chart_series,
            "questionSeries": question_series,
            "drilldown": drilldown,
            "topRated": top.iter().map(aggregate_to_json).collect::<Vec<_>>(),
            "needsImprovement": bottom.iter().map(aggregate_to_json).collect::<Vec<_>>()
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "feedback.results" => Some(handle_feedback_results(state, req)),
        _ => None,
    }
}
