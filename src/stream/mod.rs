//! Decoder for the agent CLI's line-delimited JSON event stream.
//!
//! Chunks arrive at arbitrary byte boundaries; `StreamDecoder` buffers the
//! partial trailing line and turns each complete line into display text.
//! Lines that are not a recognised event pass through unchanged.

use serde::Deserialize;
use serde_json::Value;

use crate::util::truncate_with_marker;

/// Tool and final results longer than this are truncated.
pub const MAX_RESULT_CHARS: usize = 2000;

/// Events from the agent CLI's stream-json output format.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: MessageBody },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        message: Option<MessageBody>,
    },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System {
        #[serde(default)]
        subtype: Option<String>,
    },

    /// Partial-message envelope wrapping a raw API streaming event.
    #[serde(rename = "stream_event")]
    Envelope { event: Box<StreamEvent> },

    #[serde(rename = "content_block_start")]
    ContentBlockStart { content_block: ContentBlock },

    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: Delta },

    #[serde(rename = "content_block_stop")]
    ContentBlockStop,

    #[serde(rename = "message_start")]
    MessageStart,

    #[serde(rename = "message_delta")]
    MessageDelta,

    #[serde(rename = "message_stop")]
    MessageStop,
}

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },

    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Delta {
    #[serde(rename = "text_delta")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Incremental decoder: feed chunks, get back extracted text.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: String,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return text for every line it completes.
    pub fn push(&mut self, chunk: &str) -> String {
        self.pending.push_str(chunk);
        let mut out = String::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            out.push_str(&render_line(line.trim_end_matches(['\n', '\r'])));
        }
        out
    }

    /// Flush whatever partial line is left at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        if rest.trim().is_empty() {
            String::new()
        } else {
            render_line(rest.trim_end_matches('\r'))
        }
    }
}

/// Display text for one complete line of the stream.
pub fn render_line(line: &str) -> String {
    if line.trim().is_empty() {
        return String::new();
    }
    match serde_json::from_str::<StreamEvent>(line) {
        Ok(event) => render_event(&event),
        Err(_) => format!("{}\n", line),
    }
}

fn render_event(event: &StreamEvent) -> String {
    match event {
        StreamEvent::Assistant { message } => render_blocks(&message.content),
        StreamEvent::User { message } => message
            .as_ref()
            .map(|m| render_blocks(&m.content))
            .unwrap_or_default(),
        StreamEvent::Result { result, is_error } => match result {
            Some(text) if !text.is_empty() => {
                let label = if *is_error { "error" } else { "result" };
                result_separator(label, text)
            }
            _ => String::new(),
        },
        StreamEvent::Envelope { event } => render_event(event),
        StreamEvent::ContentBlockStart { content_block } => {
            render_blocks(std::slice::from_ref(content_block))
        }
        StreamEvent::ContentBlockDelta { delta } => match delta {
            Delta::Text { text } => text.clone(),
            Delta::Other => String::new(),
        },
        StreamEvent::System { .. }
        | StreamEvent::ContentBlockStop
        | StreamEvent::MessageStart
        | StreamEvent::MessageDelta
        | StreamEvent::MessageStop => String::new(),
    }
}

fn render_blocks(blocks: &[ContentBlock]) -> String {
    let mut out = String::new();
    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                out.push_str(text);
                if !text.ends_with('\n') && !text.is_empty() {
                    out.push('\n');
                }
            }
            ContentBlock::ToolUse { name, input } => {
                out.push_str(&format!(
                    "\n──── tool: {} ────\n",
                    describe_tool_use(name, input)
                ));
            }
            ContentBlock::ToolResult { content, is_error } => {
                let text = tool_result_text(content);
                if !text.is_empty() {
                    let label = if *is_error { "tool error" } else { "tool result" };
                    out.push_str(&result_separator(label, &text));
                }
            }
            ContentBlock::Thinking { .. } | ContentBlock::Other => {}
        }
    }
    out
}

fn result_separator(label: &str, text: &str) -> String {
    format!(
        "──── {} ────\n{}\n",
        label,
        truncate_with_marker(text.trim_end(), MAX_RESULT_CHARS)
    )
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Human-readable description of a tool invocation.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match name {
        "Read" | "Write" | "Edit" => match field("file_path") {
            Some(path) => format!("{} {}", name, path),
            None => name.to_string(),
        },
        "Bash" => match field("command") {
            Some(cmd) => format!("Bash {}", crate::util::truncate_chars(cmd, 80)),
            None => name.to_string(),
        },
        "Glob" | "Grep" => match field("pattern") {
            Some(pattern) => format!("{} {}", name, pattern),
            None => name.to_string(),
        },
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assistant_text_is_extracted() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello world"}]},"session_id":"abc"}"#;
        assert_eq!(render_line(line), "Hello world\n");
    }

    #[test]
    fn test_tool_use_renders_separator() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/repo/src/main.rs"},"id":"t1"}]}}"#;
        let out = render_line(line);
        assert!(out.contains("──── tool: Read /repo/src/main.rs ────"));
    }

    #[test]
    fn test_text_delta_is_extracted() {
        let line = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"partial "}}"#;
        assert_eq!(render_line(line), "partial ");
    }

    #[test]
    fn test_wrapped_stream_event_delta_is_extracted() {
        let line = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"chunk"}}}"#;
        assert_eq!(render_line(line), "chunk");
    }

    #[test]
    fn test_input_json_delta_is_silent() {
        let line = r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"a"}}"#;
        assert_eq!(render_line(line), "");
    }

    #[test]
    fn test_content_block_start_text() {
        let line = r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":"Start"}}"#;
        assert_eq!(render_line(line), "Start\n");
    }

    #[test]
    fn test_tool_result_is_truncated() {
        let long = "x".repeat(2500);
        let line = serde_json::json!({
            "type": "user",
            "message": {"content": [{"type": "tool_result", "tool_use_id": "t1", "content": long}]}
        })
        .to_string();
        let out = render_line(&line);
        assert!(out.starts_with("──── tool result ────\n"));
        assert!(out.contains("[truncated 500 chars]"));
        assert!(!out.contains(&"x".repeat(2001)));
    }

    #[test]
    fn test_final_result_rendered_with_separator() {
        let line = r#"{"type":"result","subtype":"success","result":"All done <promise>TASK COMPLETE</promise>","is_error":false}"#;
        let out = render_line(line);
        assert!(out.starts_with("──── result ────\n"));
        assert!(out.contains("<promise>TASK COMPLETE</promise>"));
    }

    #[test]
    fn test_system_event_is_dropped() {
        let line = r#"{"type":"system","subtype":"init","session_id":"abc"}"#;
        assert_eq!(render_line(line), "");
    }

    #[test]
    fn test_unparseable_line_passes_through() {
        assert_eq!(render_line("not json at all"), "not json at all\n");
        assert_eq!(render_line(r#"{"type":"mystery","x":1}"#), "{\"type\":\"mystery\",\"x\":1}\n");
    }

    #[test]
    fn test_record_split_across_chunks_yields_one_fragment() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Hello world"}]}}"#;
        let (a, b) = line.split_at(30);
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.push(a), "");
        assert_eq!(decoder.push(b), "");
        assert_eq!(decoder.push("\n"), "Hello world\n");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut decoder = StreamDecoder::new();
        let chunk = concat!(
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"a"}}"#,
            "\n",
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"b"}}"#,
            "\n",
            "plain"
        );
        assert_eq!(decoder.push(chunk), "ab");
        assert_eq!(decoder.finish(), "plain\n");
    }

    #[test]
    fn test_describe_tool_use_bash() {
        let input = serde_json::json!({"command": "cargo test --all"});
        assert_eq!(describe_tool_use("Bash", &input), "Bash cargo test --all");
        assert_eq!(describe_tool_use("WebFetch", &input), "WebFetch");
    }
}
