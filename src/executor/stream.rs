//! Text extraction from the CLI's `stream-json` output.
//!
//! Each stdout line is a self-describing JSON record. Only "assistant"
//! messages (their text content blocks), bare "text" records, and the
//! final "result" record contribute to the accumulated output; every other
//! record kind and any unparseable line is silently skipped.

use serde_json::Value;

/// Extract the human-readable text from a full stream-json transcript.
pub fn extract_text(output: &str) -> String {
    let mut text = String::new();

    for line in output.lines() {
        let Some(record) = parse_line(line) else {
            continue;
        };
        if let Some(fragment) = extract_record_text(&record) {
            text.push_str(&fragment);
        }
    }

    text.trim().to_string()
}

/// Tolerantly parse one line as a JSON object.
fn parse_line(line: &str) -> Option<Value> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    serde_json::from_str::<Value>(line)
        .ok()
        .filter(Value::is_object)
}

/// Pull the text contribution out of a single record.
fn extract_record_text(record: &Value) -> Option<String> {
    match record.get("type")?.as_str()? {
        "assistant" => Some(extract_assistant_text(record)),
        "text" => record.get("text")?.as_str().map(String::from),
        "result" => record
            .get("result")?
            .as_str()
            .map(|s| format!("{s}\n")),
        _ => None,
    }
}

/// Concatenate the text blocks of an assistant message.
fn extract_assistant_text(record: &Value) -> String {
    let Some(content) = record
        .pointer("/message/content")
        .and_then(Value::as_array)
    else {
        return String::new();
    };

    let mut text = String::new();
    for block in content {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(s) = block.get("text").and_then(Value::as_str) {
                text.push_str(s);
                text.push('\n');
            }
        }
    }
    text
}
