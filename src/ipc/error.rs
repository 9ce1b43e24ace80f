use serde_json::json;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

/// Successful-but-superseded reply. The shell drops it instead of rendering;
/// see `guard::ViewGuards`.
pub fn stale(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": { "stale": true }
    })
}
