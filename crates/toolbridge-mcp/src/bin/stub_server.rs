//! Minimal stdio MCP server used by the integration tests.
//!
//! Tools: `echo` returns its `text` argument, `add` sums `a` and `b`, `fail`
//! reports a tool-level error. `--page-size N` splits `tools/list` into pages.

use std::io::{self, BufRead, Write};

use serde_json::{json, Value};

fn tools() -> Vec<Value> {
    vec![
        json!({
            "name": "echo",
            "description": "Echo the given text",
            "inputSchema": {
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }
        }),
        json!({
            "name": "add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                "required": ["a", "b"]
            }
        }),
        json!({
            "name": "fail",
            "description": "Always reports an error"
        }),
    ]
}

fn page_size() -> Option<usize> {
    let args: Vec<String> = std::env::args().collect();
    args.iter()
        .position(|a| a == "--page-size")
        .and_then(|i| args.get(i + 1))
        .and_then(|n| n.parse().ok())
        .filter(|n| *n > 0)
}

fn text(content: impl Into<String>, is_error: bool) -> Value {
    json!({
        "content": [{"type": "text", "text": content.into()}],
        "isError": is_error
    })
}

fn call_tool(params: &Value) -> Result<Value, (i64, String)> {
    let name = params["name"].as_str().unwrap_or_default();
    let arguments = &params["arguments"];

    match name {
        "echo" => Ok(text(arguments["text"].as_str().unwrap_or_default(), false)),
        "add" => match (arguments["a"].as_f64(), arguments["b"].as_f64()) {
            (Some(a), Some(b)) => Ok(text((a + b).to_string(), false)),
            _ => Err((-32602, "a and b must be numbers".to_string())),
        },
        "fail" => Ok(text("something went wrong", true)),
        other => Err((-32602, format!("Unknown tool: {}", other))),
    }
}

fn list_tools(params: &Value, page_size: Option<usize>) -> Value {
    let all = tools();
    let Some(size) = page_size else {
        return json!({ "tools": all });
    };

    let start: usize = params["cursor"].as_str().and_then(|c| c.parse().ok()).unwrap_or(0);
    let end = (start + size).min(all.len());
    let page: Vec<Value> = all[start.min(end)..end].to_vec();
    let mut result = json!({ "tools": page });
    if end < all.len() {
        result["nextCursor"] = json!(end.to_string());
    }
    result
}

fn handle(request: &Value, page_size: Option<usize>) -> Option<Value> {
    let id = request.get("id")?.clone();
    let method = request["method"].as_str().unwrap_or_default();
    let params = request.get("params").cloned().unwrap_or(Value::Null);

    let outcome = match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": true}},
            "serverInfo": {"name": "stub-server", "version": env!("CARGO_PKG_VERSION")}
        })),
        "tools/list" => Ok(list_tools(&params, page_size)),
        "tools/call" => call_tool(&params),
        "ping" => Ok(json!({})),
        other => Err((-32601, format!("Method not found: {}", other))),
    };

    Some(match outcome {
        Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Err((code, message)) => json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}),
    })
}

fn main() -> io::Result<()> {
    let page_size = page_size();
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    eprintln!("stub-server ready");

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                eprintln!("stub-server: bad input: {}", e);
                continue;
            }
        };

        // Notifications and responses get no answer.
        if request.get("method").is_none() {
            continue;
        }

        if let Some(response) = handle(&request, page_size) {
            writeln!(stdout, "{}", response)?;
            stdout.flush()?;
        }
    }

    Ok(())
}
