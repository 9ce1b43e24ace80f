mod agg;
mod db;
mod export;
mod ipc;

use std::io::{self, BufRead, Write};

fn emit(stdout: &mut io::Stdout, payload: &str) {
    let _ = writeln!(stdout, "{}", payload);
    let _ = stdout.flush();
}

fn main() {
    let mut state = ipc::AppState::new();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => {
                let resp = ipc::handle_request(&mut state, req);
                let payload = serde_json::to_string(&resp)
                    .unwrap_or_else(|_| "{\"ok\":false}".to_string());
                emit(&mut stdout, &payload);
            }
            Err(e) => {
                // Unparseable line carries no id to echo back.
                emit(
                    &mut stdout,
                    &format!(
                        "{{\"ok\":false,\"error\":{{\"code\":\"bad_json\",\"message\":{}}}}}",
                        serde_json::Value::String(e.to_string())
                    ),
                );
            }
        }
    }
}
